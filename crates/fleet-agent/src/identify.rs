//! Project-type identification.
//!
//! Each identifier is a conjunction of predicates over a process. The
//! registry keeps them ordered by hit count so the common types are tried
//! first; a hit promotes its entry past every entry with fewer hits.

use std::sync::{Mutex, PoisonError};

use fleet_core::ProjectType;
use regex::Regex;

use crate::proc::ProcInfo;

#[derive(Debug, Clone)]
pub struct Identifier {
    pub project_type: ProjectType,
    /// Executable file name, e.g. `java`.
    pub exe: Option<String>,
    /// Environment variables that must be present.
    pub env: Vec<String>,
    /// Substrings some argument must contain.
    pub argv_contains: Vec<String>,
    /// Pattern the space-joined command line must match.
    pub argv_regex: Option<Regex>,
}

impl Identifier {
    pub fn new(project_type: ProjectType) -> Self {
        Self {
            project_type,
            exe: None,
            env: Vec::new(),
            argv_contains: Vec::new(),
            argv_regex: None,
        }
    }

    pub fn exe(mut self, name: &str) -> Self {
        self.exe = Some(name.to_string());
        self
    }

    pub fn env(mut self, key: &str) -> Self {
        self.env.push(key.to_string());
        self
    }

    pub fn argv_contains(mut self, needle: &str) -> Self {
        self.argv_contains.push(needle.to_string());
        self
    }

    pub fn argv_regex(mut self, re: Regex) -> Self {
        self.argv_regex = Some(re);
        self
    }

    pub fn matches(&self, proc: &ProcInfo) -> bool {
        if let Some(exe) = &self.exe {
            if proc.exe_name() != exe && proc.cmdline.first().map(String::as_str) != Some(exe) {
                return false;
            }
        }
        if !self.env.iter().all(|k| proc.env.contains_key(k)) {
            return false;
        }
        if !self
            .argv_contains
            .iter()
            .all(|needle| proc.cmdline.iter().any(|arg| arg.contains(needle.as_str())))
        {
            return false;
        }
        match &self.argv_regex {
            Some(re) => re.is_match(&proc.cmdline.join(" ")),
            None => true,
        }
    }
}

struct Entry {
    identifier: Identifier,
    hits: u64,
}

/// Ordered identifier list, shared by the scanner.
#[derive(Default)]
pub struct TypeRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl TypeRegistry {
    pub fn new(identifiers: impl IntoIterator<Item = Identifier>) -> Self {
        Self {
            entries: Mutex::new(
                identifiers
                    .into_iter()
                    .map(|identifier| Entry { identifier, hits: 0 })
                    .collect(),
            ),
        }
    }

    pub fn identify(&self, proc: &ProcInfo) -> Option<ProjectType> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = entries.iter().position(|e| e.identifier.matches(proc))?;
        entries[idx].hits += 1;
        let hits = entries[idx].hits;
        let target = entries[..idx]
            .iter()
            .position(|e| e.hits <= hits)
            .unwrap_or(idx);
        let entry = entries.remove(idx);
        let project_type = entry.identifier.project_type.clone();
        entries.insert(target, entry);
        Some(project_type)
    }

    /// Current order, most used first.
    pub fn order(&self) -> Vec<(ProjectType, u64)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| (e.identifier.project_type.clone(), e.hits))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(exe: &str, argv: &[&str], env: &[&str]) -> ProcInfo {
        ProcInfo {
            pid: 1,
            ppid: 0,
            exe: exe.to_string(),
            cmdline: argv.iter().map(|s| s.to_string()).collect(),
            env: env.iter().map(|k| (k.to_string(), "1".to_string())).collect(),
        }
    }

    #[test]
    fn identifier_predicates_all_apply() {
        let id = Identifier::new(ProjectType::java())
            .exe("java")
            .argv_contains("-Djava.apps.prog=")
            .argv_regex(Regex::new(r"-jar \S+\.jar").unwrap());
        assert!(id.matches(&proc(
            "/usr/bin/java",
            &["java", "-Djava.apps.prog=a-b", "-jar", "x.jar"],
            &[]
        )));
        assert!(!id.matches(&proc("/usr/bin/java", &["java", "-jar", "x.jar"], &[])));
        assert!(!id.matches(&proc("/usr/bin/python", &["python", "-Djava.apps.prog=a"], &[])));

        let by_env = Identifier::new(ProjectType::new("node")).env("_depolyKey");
        assert!(by_env.matches(&proc("/bin/node", &["node"], &["_depolyKey"])));
        assert!(!by_env.matches(&proc("/bin/node", &["node"], &[])));
    }

    #[test]
    fn hits_promote_entries() {
        let registry = TypeRegistry::new([
            Identifier::new(ProjectType::java()).exe("java"),
            Identifier::new(ProjectType::redis()).exe("redis-server"),
        ]);
        let redis = proc("/usr/bin/redis-server", &["redis-server *:6379"], &[]);
        let java = proc("/usr/bin/java", &["java"], &[]);

        assert_eq!(registry.identify(&redis), Some(ProjectType::redis()));
        assert_eq!(registry.order()[0], (ProjectType::redis(), 1));

        // equal hit counts: the most recent hit goes first
        assert_eq!(registry.identify(&java), Some(ProjectType::java()));
        assert_eq!(registry.order()[0], (ProjectType::java(), 1));

        registry.identify(&redis);
        registry.identify(&redis);
        registry.identify(&java);
        assert_eq!(
            registry.order(),
            [(ProjectType::redis(), 3), (ProjectType::java(), 2)]
        );

        assert_eq!(registry.identify(&proc("/bin/sh", &["sh"], &[])), None);
    }
}
