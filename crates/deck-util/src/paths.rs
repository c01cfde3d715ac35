use std::path::{Component, Path, PathBuf};

pub const APP_DIR_NAME: &str = "deck-assistant";

pub const ENV_XDG_CONFIG_HOME: &str = "XDG_CONFIG_HOME";
pub const ENV_XDG_DATA_HOME: &str = "XDG_DATA_HOME";
pub const ENV_XDG_DATA_DIRS: &str = "XDG_DATA_DIRS";

const DEFAULT_CONFIG_HOME: &str = "$HOME/.config";
const DEFAULT_DATA_HOME: &str = "$HOME/.local/share";
const DEFAULT_DATA_DIRS: &str = "/usr/local/share:/usr/share";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("{name:?} not found\n\nlooked for:\n{}", format_checked(.checked))]
    NotFound { name: String, checked: Vec<PathBuf> },
}

fn format_checked(checked: &[PathBuf]) -> String {
    checked
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Snapshot of the environment variables that shape the path layout.
#[derive(Debug, Clone, Default)]
pub struct PathEnv {
    pub xdg_config_home: Option<String>,
    pub xdg_data_home: Option<String>,
    pub xdg_data_dirs: Option<String>,
    pub home: Option<String>,
    pub appdata: Option<String>,
    pub path: Option<String>,
}

impl PathEnv {
    pub fn from_process() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        PathEnv {
            xdg_config_home: var(ENV_XDG_CONFIG_HOME),
            xdg_data_home: var(ENV_XDG_DATA_HOME),
            xdg_data_dirs: var(ENV_XDG_DATA_DIRS),
            home: var("HOME"),
            appdata: var("APPDATA"),
            path: var("PATH"),
        }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "HOME" => self.home.as_deref(),
            "APPDATA" => self.appdata.as_deref(),
            ENV_XDG_CONFIG_HOME => self.xdg_config_home.as_deref(),
            ENV_XDG_DATA_HOME => self.xdg_data_home.as_deref(),
            ENV_XDG_DATA_DIRS => self.xdg_data_dirs.as_deref(),
            "PATH" => self.path.as_deref(),
            _ => None,
        }
    }
}

/// Where scripts, modules and config files are looked up.
#[derive(Debug, Clone, Default)]
pub struct Paths {
    sandbox_dir: Option<PathBuf>,
    config_home: Option<PathBuf>,
    data_home: Option<PathBuf>,
    data_dirs: Vec<PathBuf>,
    exec_dirs: Vec<PathBuf>,
}

impl Paths {
    pub fn detect() -> Self {
        Paths::from_env(&PathEnv::from_process())
    }

    pub fn from_env(env: &PathEnv) -> Self {
        let config_home = if cfg!(windows) && env.appdata.is_some() {
            env.appdata.as_deref().map(PathBuf::from)
        } else {
            single_dir(env, env.xdg_config_home.as_deref(), DEFAULT_CONFIG_HOME)
        };
        let data_home = if cfg!(windows) && env.appdata.is_some() {
            env.appdata.as_deref().map(PathBuf::from)
        } else {
            single_dir(env, env.xdg_data_home.as_deref(), DEFAULT_DATA_HOME)
        };

        let raw_dirs = env.xdg_data_dirs.as_deref().unwrap_or(DEFAULT_DATA_DIRS);
        let data_dirs = split_search_path(&expand_vars(raw_dirs, |n| env.lookup(n)))
            .map(|d| d.join(APP_DIR_NAME))
            .filter(|d| d.is_dir())
            .collect();

        let exec_dirs = env
            .path
            .as_deref()
            .map(|p| split_search_path(p).collect())
            .unwrap_or_default();

        Paths {
            sandbox_dir: None,
            config_home: config_home.map(|p| p.join(APP_DIR_NAME)),
            data_home: data_home.map(|p| p.join(APP_DIR_NAME)),
            data_dirs,
            exec_dirs,
        }
    }

    pub fn with_sandbox_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.set_sandbox_dir(dir);
        self
    }

    pub fn set_sandbox_dir(&mut self, dir: impl Into<PathBuf>) {
        self.sandbox_dir = Some(normalize_lexically(&dir.into()));
    }

    /// Overrides the per-user and system data dirs (used by embedders and tests).
    pub fn set_data_dirs(&mut self, data_home: Option<PathBuf>, system: Vec<PathBuf>) {
        self.data_home = data_home;
        self.data_dirs = system;
    }

    pub fn sandbox_dir(&self) -> Option<&Path> {
        self.sandbox_dir.as_deref()
    }

    pub fn config_home(&self) -> Option<&Path> {
        self.config_home.as_deref()
    }

    pub fn data_home(&self) -> Option<&Path> {
        self.data_home.as_deref()
    }

    pub fn data_dirs(&self) -> &[PathBuf] {
        &self.data_dirs
    }

    pub fn resolve_data_file(
        &self,
        name: &str,
        allow_local: bool,
        allow_home: bool,
        allow_system: bool,
    ) -> Result<PathBuf, PathError> {
        let mut bases: Vec<&Path> = Vec::new();
        if allow_local {
            bases.extend(self.sandbox_dir.as_deref());
        }
        if allow_home {
            bases.extend(self.data_home.as_deref());
        }
        if allow_system {
            bases.extend(self.data_dirs.iter().map(PathBuf::as_path));
        }
        resolve_in(name, &bases)
    }

    pub fn find_data_file(
        &self,
        name: &str,
        allow_local: bool,
        allow_home: bool,
        allow_system: bool,
    ) -> Option<PathBuf> {
        self.resolve_data_file(name, allow_local, allow_home, allow_system)
            .ok()
    }

    pub fn find_config_file(&self, name: &str) -> Option<PathBuf> {
        let bases: Vec<&Path> = self.config_home.as_deref().into_iter().collect();
        resolve_in(name, &bases).ok()
    }

    /// Searches PATH entries only; names containing separators are rejected.
    pub fn find_executable(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return None;
        }
        self.exec_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|cand| is_executable(cand))
    }
}

fn resolve_in(name: &str, bases: &[&Path]) -> Result<PathBuf, PathError> {
    let mut checked = Vec::new();
    for base in bases {
        let cand = normalize_lexically(&base.join(name));
        if !verify_path_contains_path(base, &cand) {
            continue;
        }
        checked.push(cand.clone());
        if cand.is_file() {
            return Ok(cand);
        }
    }
    Err(PathError::NotFound {
        name: name.to_string(),
        checked,
    })
}

fn single_dir(env: &PathEnv, value: Option<&str>, fallback: &str) -> Option<PathBuf> {
    match value {
        Some(v) => Some(PathBuf::from(v)),
        None if env.home.is_none() => None,
        None => Some(PathBuf::from(expand_vars(fallback, |n| env.lookup(n)))),
    }
}

fn split_search_path(raw: &str) -> impl Iterator<Item = PathBuf> + '_ {
    let sep = if cfg!(windows) { ';' } else { ':' };
    raw.split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

/// Expands `$VAR`, `${VAR}` and `%VAR%`; unknown variables expand to nothing.
pub fn expand_vars<'a>(input: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find(['$', '%']) {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];
        let (name, consumed) = if let Some(inner) = tail.strip_prefix("${") {
            match inner.find('}') {
                Some(end) => (&inner[..end], end + 3),
                None => ("", 0),
            }
        } else if let Some(inner) = tail.strip_prefix('$') {
            let end = inner
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(inner.len());
            (&inner[..end], end + 1)
        } else {
            let inner = &tail[1..];
            match inner.find('%') {
                Some(end) if end > 0 => (&inner[..end], end + 2),
                _ => ("", 0),
            }
        };
        if consumed == 0 || name.is_empty() {
            out.push_str(&tail[..1]);
            rest = &tail[1..];
            continue;
        }
        out.push_str(lookup(name).unwrap_or(""));
        rest = &tail[consumed..];
    }
    out.push_str(rest);
    out
}

/// Resolves `.` and `..` without touching the filesystem. `..` never climbs
/// above the root of an absolute path.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(comp),
            },
            other => out.push(other),
        }
    }
    out.iter().map(|c| c.as_os_str()).collect()
}

/// True when `candidate`, after normalization, lies at or below `base`.
pub fn verify_path_contains_path(base: &Path, candidate: &Path) -> bool {
    let base = normalize_lexically(base);
    let candidate = normalize_lexically(candidate);
    let mut base_it = base.components();
    let mut cand_it = candidate.components();
    loop {
        match (base_it.next(), cand_it.next()) {
            (None, _) => return true,
            (Some(_), None) => return false,
            (Some(b), Some(c)) if b == c => continue,
            _ => return false,
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
