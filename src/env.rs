use std::env;
use std::sync::Mutex;

use fxhash::FxHashMap;

/// Seam for everything that touches the process environment: `$VAR`
/// interpolation in the reader and `option env=` writes in the parser.
pub trait EnvProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// The real process environment.
#[derive(Debug, Default)]
pub struct ProcessEnv;

impl EnvProvider for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn set(&self, key: &str, value: &str) {
        env::set_var(key, value);
    }
}

/// In-memory environment for hermetic loads and tests.
#[derive(Debug, Default)]
pub struct MapEnv {
    vars: Mutex<FxHashMap<String, String>>,
}

impl MapEnv {
    pub fn new() -> MapEnv {
        MapEnv::default()
    }

    pub fn with<K: Into<String>, V: Into<String>>(vars: impl IntoIterator<Item = (K, V)>) -> MapEnv {
        let map = MapEnv::new();
        {
            let mut guard = map.vars.lock().unwrap();
            for (k, v) in vars {
                guard.insert(k.into(), v.into());
            }
        }
        map
    }
}

impl EnvProvider for MapEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.vars.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.vars
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}
