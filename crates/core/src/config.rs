use std::env;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Read an env var, treating empty values as unset.
pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Source of override values, keyed by fully-qualified env var name.
///
/// The process environment is the production source; tests pass a map so
/// they never touch global state.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        env_opt(key)
    }
}

impl EnvSource for std::collections::HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        std::collections::HashMap::get(self, key)
            .filter(|s| !s.is_empty())
            .cloned()
    }
}

/// Profile-aware lookup: tries `{PROFILE}_{KEY}` first, falls back to `{KEY}`.
///
/// With an empty profile this is a plain lookup.
pub struct Profiled<'a, E: EnvSource + ?Sized> {
    source: &'a E,
    profile: String,
}

impl<'a, E: EnvSource + ?Sized> Profiled<'a, E> {
    pub fn new(source: &'a E, profile: &str) -> Self {
        Self {
            source,
            profile: profile.to_uppercase(),
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if !self.profile.is_empty() {
            let prefixed = format!("{}_{}", self.profile, key);
            if let Some(v) = self.source.get(&prefixed) {
                return Some(v);
            }
        }
        self.source.get(key)
    }

    /// Parse the value, ignoring it (with a warning) when it does not parse.
    pub fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable env override");
                None
            }
        }
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).map(|v| {
            matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }
}
