//! List/watch filtering by label and field selectors.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use fleet_core::Selector;

/// Label and field sets extracted from an object.
#[derive(Debug, Clone, Default)]
pub struct Attrs {
    pub labels: BTreeMap<String, String>,
    pub fields: BTreeMap<String, String>,
}

type Extractor<T> = Arc<dyn Fn(&T) -> Attrs + Send + Sync>;

/// `{label selector, field selector, attribute extractor}`.
pub struct Predicate<T> {
    label: Selector,
    field: Selector,
    extractor: Option<Extractor<T>>,
}

impl<T> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            field: self.field.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

impl<T> fmt::Debug for Predicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate")
            .field("label", &self.label.to_string())
            .field("field", &self.field.to_string())
            .finish()
    }
}

impl<T> Default for Predicate<T> {
    fn default() -> Self {
        Self::everything()
    }
}

impl<T> Predicate<T> {
    /// Matches every object.
    pub fn everything() -> Self {
        Self {
            label: Selector::everything(),
            field: Selector::everything(),
            extractor: None,
        }
    }

    pub fn new(
        label: Selector,
        field: Selector,
        extractor: impl Fn(&T) -> Attrs + Send + Sync + 'static,
    ) -> Self {
        Self {
            label,
            field,
            extractor: Some(Arc::new(extractor)),
        }
    }

    /// Field-only predicate.
    pub fn fields(field: Selector, extractor: impl Fn(&T) -> Attrs + Send + Sync + 'static) -> Self {
        Self::new(Selector::everything(), field, extractor)
    }

    pub fn is_everything(&self) -> bool {
        self.label.is_empty() && self.field.is_empty()
    }

    pub fn matches(&self, obj: &T) -> bool {
        if self.is_everything() {
            return true;
        }
        let attrs = match &self.extractor {
            Some(extract) => extract(obj),
            None => Attrs::default(),
        };
        self.label.matches(&attrs.labels) && self.field.matches(&attrs.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{DeployKey, Instance};

    fn by_host() -> Predicate<Instance> {
        Predicate::fields("hostID=h1".parse().unwrap(), |ins: &Instance| {
            let mut attrs = Attrs::default();
            attrs.fields.insert("hostID".into(), ins.host_id.clone());
            attrs
        })
    }

    #[test]
    fn field_predicate_filters() {
        let key = DeployKey::new("java", "crm");
        let pred = by_host();
        assert!(pred.matches(&Instance::sample(&key, "i1", "h1", "v1")));
        assert!(!pred.matches(&Instance::sample(&key, "i2", "h2", "v1")));
    }

    #[test]
    fn everything_matches_without_extractor() {
        let pred: Predicate<Instance> = Predicate::everything();
        let key = DeployKey::new("java", "crm");
        assert!(pred.matches(&Instance::sample(&key, "i1", "h9", "v1")));
    }
}
