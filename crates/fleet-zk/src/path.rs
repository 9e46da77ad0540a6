//! ZooKeeper ↔ store path mapping.
//!
//! ```text
//!   v2  /service/{name}/{route|config|instance}/{rest…}
//!         ↔ {root}/{stage}/{kind}/2/{name}/{rest…}
//!   v4  /biz/{group}/{app}/{policy|config|daemon}/{rest…}
//!         ↔ {root}/{stage}/{route|config|instance}/4/{group}.{app}/{rest…}
//! ```
//!
//! Pure functions; a path maps back to exactly the path it came from.

use std::fmt;

use fleet_core::Stage;
use fleet_registry::RouteVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZkKind {
    Route,
    Config,
    /// Service registrations. Never mirrored.
    Instance,
}

impl ZkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZkKind::Route => "route",
            ZkKind::Config => "config",
            ZkKind::Instance => "instance",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "route" => Some(ZkKind::Route),
            "config" => Some(ZkKind::Config),
            "instance" => Some(ZkKind::Instance),
            _ => None,
        }
    }

    fn v4_segment(&self) -> &'static str {
        match self {
            ZkKind::Route => "policy",
            ZkKind::Config => "config",
            ZkKind::Instance => "daemon",
        }
    }

    fn from_v4_segment(s: &str) -> Option<Self> {
        match s {
            "policy" => Some(ZkKind::Route),
            "config" => Some(ZkKind::Config),
            "daemon" => Some(ZkKind::Instance),
            _ => None,
        }
    }
}

impl fmt::Display for ZkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ZooKeeper node decomposed into its mirrored parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorPath {
    pub version: RouteVersion,
    pub kind: ZkKind,
    /// `{name}` for v2, `{group}.{app}` for v4.
    pub app: String,
    pub rest: Vec<String>,
}

fn segments(path: &str) -> Option<Vec<&str>> {
    let trimmed = path.strip_prefix('/')?.trim_end_matches('/');
    let parts: Vec<&str> = trimmed.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(parts)
}

impl MirrorPath {
    pub fn from_zk(path: &str) -> Option<Self> {
        let parts = segments(path)?;
        match parts.as_slice() {
            ["service", name, kind, rest @ ..] => Some(Self {
                version: RouteVersion::V2,
                kind: ZkKind::parse(kind)?,
                app: name.to_string(),
                rest: rest.iter().map(|s| s.to_string()).collect(),
            }),
            ["biz", group, app, kind, rest @ ..] => {
                if group.contains('.') || app.contains('.') {
                    return None;
                }
                Some(Self {
                    version: RouteVersion::V4,
                    kind: ZkKind::from_v4_segment(kind)?,
                    app: format!("{group}.{app}"),
                    rest: rest.iter().map(|s| s.to_string()).collect(),
                })
            }
            _ => None,
        }
    }

    pub fn to_zk(&self) -> Option<String> {
        let mut out = match self.version {
            RouteVersion::V2 => format!("/service/{}/{}", self.app, self.kind),
            RouteVersion::V4 => {
                let (group, app) = self.app.split_once('.')?;
                format!("/biz/{group}/{app}/{}", self.kind.v4_segment())
            }
        };
        for seg in &self.rest {
            out.push('/');
            out.push_str(seg);
        }
        Some(out)
    }

    /// Store key relative to the mirror root: `{stage}/{kind}/{2|4}/{app}/{rest…}`.
    pub fn store_key(&self, stage: Stage) -> String {
        let mut out = format!("{stage}/{}/{}/{}", self.kind, self.version.as_str(), self.app);
        for seg in &self.rest {
            out.push('/');
            out.push_str(seg);
        }
        out
    }

    pub fn from_store_key(key: &str) -> Option<(Stage, Self)> {
        let parts: Vec<&str> = key.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            [stage, kind, version, app, rest @ ..] => {
                let version = match *version {
                    "2" => RouteVersion::V2,
                    "4" => RouteVersion::V4,
                    _ => return None,
                };
                if app.is_empty() || rest.iter().any(|s| s.is_empty()) {
                    return None;
                }
                Some((
                    stage.parse().ok()?,
                    Self {
                        version,
                        kind: ZkKind::parse(kind)?,
                        app: app.to_string(),
                        rest: rest.iter().map(|s| s.to_string()).collect(),
                    },
                ))
            }
            _ => None,
        }
    }
}

/// Maps between ZooKeeper paths and absolute store paths under `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapper {
    root: String,
}

impl PathMapper {
    pub fn new(root: &str) -> Self {
        Self {
            root: format!("/{}", root.trim_matches('/')),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Absolute store path for a ZooKeeper node in `stage`.
    pub fn get_etcd_path(&self, stage: Stage, zk_path: &str) -> Option<String> {
        let mp = MirrorPath::from_zk(zk_path)?;
        Some(format!("{}/{}", self.root, mp.store_key(stage)))
    }

    /// ZooKeeper node for an absolute store path.
    pub fn get_zk_path(&self, store_path: &str) -> Option<String> {
        let rel = store_path.strip_prefix(&self.root)?.strip_prefix('/')?;
        let (_, mp) = MirrorPath::from_store_key(rel)?;
        mp.to_zk()
    }
}
