//! Plugin discovery.
//!
//! A plugins directory holds `.ez` archives and exploded trees, each
//! carrying an application descriptor at `ebin/<name>.app`. Discovery
//! parses the descriptors and reports name, version, description and the
//! dependencies not already provided by the runtime. Enabled plugins are a
//! single list term; activation closes over the dependency DAG.

mod ez;
mod terms;

pub use terms::{parse_term, Term};

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Ez,
    Dir,
}

#[derive(Debug, Clone)]
pub struct Plugin {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Declared dependencies minus those the runtime already provides.
    pub dependencies: Vec<String>,
    pub location: PathBuf,
    pub kind: PluginKind,
}

/// Which way to walk the dependency DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Everything the roots depend on, transitively.
    Reachable,
    /// Everything that depends on the roots, transitively.
    Reaching,
}

/// Scans `plugins_dir` for plugins. `provided` names applications the
/// runtime ships with; they are filtered out of dependency lists.
pub fn discover(plugins_dir: impl AsRef<Path>, provided: &[&str]) -> Result<Vec<Plugin>> {
    let dir = plugins_dir.as_ref();
    let mut plugins = Vec::new();
    if !dir.exists() {
        return Ok(plugins);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let result = if path.extension().and_then(|e| e.to_str()) == Some("ez") {
            discover_ez(&path, provided)
        } else if path.is_dir() {
            discover_dir(&path, provided)
        } else {
            continue;
        };
        match result {
            Ok(Some(plugin)) => plugins.push(plugin),
            Ok(None) => {}
            Err(err) => log::warn!("skipping plugin at {}: {err}", path.display()),
        }
    }
    plugins.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(plugins)
}

fn discover_ez(path: &Path, provided: &[&str]) -> Result<Option<Plugin>> {
    let bytes = std::fs::read(path)?;
    let entries = ez::list_entries(&bytes)?;
    for entry in &entries {
        let is_app = entry.name.ends_with(".app")
            && entry
                .name
                .rsplitn(3, '/')
                .nth(1)
                .map_or(false, |dir| dir == "ebin");
        if is_app {
            let descriptor = ez::read_entry(&bytes, entry)?;
            let text = String::from_utf8_lossy(&descriptor);
            let plugin = parse_descriptor(&text, path.to_path_buf(), PluginKind::Ez, provided)?;
            return Ok(Some(plugin));
        }
    }
    Ok(None)
}

fn discover_dir(path: &Path, provided: &[&str]) -> Result<Option<Plugin>> {
    let ebin = path.join("ebin");
    if !ebin.is_dir() {
        return Ok(None);
    }
    for entry in std::fs::read_dir(&ebin)? {
        let app_path = entry?.path();
        if app_path.extension().and_then(|e| e.to_str()) == Some("app") {
            let text = std::fs::read_to_string(&app_path)?;
            let plugin = parse_descriptor(&text, path.to_path_buf(), PluginKind::Dir, provided)?;
            return Ok(Some(plugin));
        }
    }
    Ok(None)
}

/// Parses `{application, Name, Props}.` into a `Plugin`.
fn parse_descriptor(
    text: &str,
    location: PathBuf,
    kind: PluginKind,
    provided: &[&str],
) -> Result<Plugin> {
    let term = parse_term(text)?;
    let tuple = term
        .as_tuple()
        .filter(|t| t.len() == 3 && t[0].as_atom() == Some("application"))
        .ok_or_else(|| Error::BadDescriptor("expected {application, Name, Props}".into()))?;
    let name = tuple[1]
        .as_atom()
        .ok_or_else(|| Error::BadDescriptor("application name must be an atom".into()))?
        .to_string();
    let props = tuple[2]
        .as_list()
        .ok_or_else(|| Error::BadDescriptor("application properties must be a list".into()))?;

    let mut version = String::new();
    let mut description = String::new();
    let mut dependencies = Vec::new();
    for prop in props {
        let Some(pair) = prop.as_tuple().filter(|p| p.len() == 2) else {
            continue;
        };
        match pair[0].as_atom() {
            Some("vsn") => version = pair[1].as_str().unwrap_or_default().to_string(),
            Some("description") => {
                description = pair[1].as_str().unwrap_or_default().to_string()
            }
            Some("applications") => {
                if let Some(apps) = pair[1].as_list() {
                    dependencies = apps
                        .iter()
                        .filter_map(Term::as_atom)
                        .filter(|app| !provided.contains(app))
                        .map(str::to_string)
                        .collect();
                }
            }
            _ => {}
        }
    }
    Ok(Plugin {
        name,
        version,
        description,
        dependencies,
        location,
        kind,
    })
}

/// Reads the enabled-plugins file: one term, a list of atoms.
pub fn read_enabled(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let text = match std::fs::read_to_string(path.as_ref()) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let term = parse_term(&text)?;
    let list = term
        .as_list()
        .ok_or_else(|| Error::BadDescriptor("enabled plugins must be a list".into()))?;
    list.iter()
        .map(|t| {
            t.as_atom()
                .map(str::to_string)
                .ok_or_else(|| Error::BadDescriptor("enabled plugin names must be atoms".into()))
        })
        .collect()
}

/// Closes `roots` over the dependency DAG in the given direction. Unknown
/// names are ignored; the result is sorted and includes the roots.
pub fn dependency_closure(plugins: &[Plugin], roots: &[String], direction: Direction) -> Vec<String> {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for plugin in plugins {
        for dep in &plugin.dependencies {
            match direction {
                Direction::Reachable => edges
                    .entry(plugin.name.as_str())
                    .or_default()
                    .push(dep.as_str()),
                Direction::Reaching => {
                    edges.entry(dep.as_str()).or_default().push(plugin.name.as_str())
                }
            }
        }
    }
    let known: HashSet<&str> = plugins.iter().map(|p| p.name.as_str()).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = roots
        .iter()
        .map(String::as_str)
        .filter(|name| known.contains(name))
        .collect();
    while let Some(name) = queue.pop_front() {
        if !seen.insert(name) {
            continue;
        }
        if let Some(nexts) = edges.get(name) {
            for next in nexts {
                if known.contains(next) && !seen.contains(next) {
                    queue.push_back(next);
                }
            }
        }
    }
    let mut result: Vec<String> = seen.into_iter().map(str::to_string).collect();
    result.sort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(name: &str, deps: &[&str]) -> String {
        let mut apps = vec!["kernel", "stdlib"];
        apps.extend_from_slice(deps);
        let apps = apps.join(", ");
        format!(
            "{{application, {name},\n [{{vsn, \"0.9\"}},\n  {{description, \"{name} plugin\"}},\n  {{applications, [{apps}]}}]}}.\n"
        )
    }

    fn write_dir_plugin(root: &Path, name: &str, deps: &[&str]) {
        let ebin = root.join(name).join("ebin");
        std::fs::create_dir_all(&ebin).unwrap();
        std::fs::write(ebin.join(format!("{name}.app")), descriptor(name, deps)).unwrap();
    }

    #[test]
    fn discovers_dirs_and_archives() {
        let dir = TempDir::new().unwrap();
        write_dir_plugin(dir.path(), "alpha", &["beta"]);

        let app = descriptor("beta", &["gamma"]);
        let zip = super::ez::testutil::build_stored_zip(&[(
            "beta-0.9/ebin/beta.app",
            app.as_bytes(),
        )]);
        std::fs::write(dir.path().join("beta-0.9.ez"), zip).unwrap();

        let plugins = discover(dir.path(), &["kernel", "stdlib"]).unwrap();
        assert_eq!(plugins.len(), 2);
        assert_eq!(plugins[0].name, "alpha");
        assert_eq!(plugins[0].kind, PluginKind::Dir);
        assert_eq!(plugins[0].dependencies, vec!["beta".to_string()]);
        assert_eq!(plugins[0].version, "0.9");
        assert_eq!(plugins[1].name, "beta");
        assert_eq!(plugins[1].kind, PluginKind::Ez);
        assert_eq!(plugins[1].dependencies, vec!["gamma".to_string()]);
    }

    #[test]
    fn enabled_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("enabled_plugins");
        std::fs::write(&path, "[alpha, beta].\n").unwrap();
        assert_eq!(read_enabled(&path).unwrap(), vec!["alpha", "beta"]);
        assert!(read_enabled(dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn closures_walk_both_directions() {
        let dir = TempDir::new().unwrap();
        write_dir_plugin(dir.path(), "a", &["b"]);
        write_dir_plugin(dir.path(), "b", &["c"]);
        write_dir_plugin(dir.path(), "c", &[]);
        write_dir_plugin(dir.path(), "d", &["c"]);
        let plugins = discover(dir.path(), &["kernel", "stdlib"]).unwrap();

        let deps = dependency_closure(&plugins, &["a".into()], Direction::Reachable);
        assert_eq!(deps, vec!["a", "b", "c"]);

        let dependants = dependency_closure(&plugins, &["c".into()], Direction::Reaching);
        assert_eq!(dependants, vec!["a", "b", "c", "d"]);
    }
}
