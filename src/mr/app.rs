use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use libloading::Library;

use crate::mr::worker::KeyValue;
use crate::mrapps::wc;

pub type MapFunc = fn(&str, &str) -> Vec<KeyValue>;
pub type ReduceFunc = fn(&str, &[String]) -> String;

/// A pair of user map/reduce functions, either compiled in or pulled out of
/// a shared library exporting `map` and `reduce`.
#[derive(Clone)]
pub struct Application {
    name: String,
    pub map: MapFunc,
    pub reduce: ReduceFunc,
    // keeps the symbols above valid for as long as any clone is alive
    _lib: Option<Arc<Library>>,
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("dynamic", &self._lib.is_some())
            .finish()
    }
}

impl Application {
    pub fn new(name: impl Into<String>, map: MapFunc, reduce: ReduceFunc) -> Self {
        Application {
            name: name.into(),
            map,
            reduce,
            _lib: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "wc" => Some(Application::new("wc", wc::map, wc::reduce)),
            _ => None,
        }
    }

    /// Loads `map` and `reduce` from the library at `path`. The library must
    /// be built against this crate so the function signatures agree.
    pub fn load(path: &Path) -> Result<Self> {
        unsafe {
            let lib = Library::new(path)
                .with_context(|| format!("failed to load library {}", path.display()))?;
            let map: MapFunc = *lib
                .get::<MapFunc>(b"map")
                .with_context(|| format!("{} exports no `map`", path.display()))?;
            let reduce: ReduceFunc = *lib
                .get::<ReduceFunc>(b"reduce")
                .with_context(|| format!("{} exports no `reduce`", path.display()))?;
            Ok(Application {
                name: path.display().to_string(),
                map,
                reduce,
                _lib: Some(Arc::new(lib)),
            })
        }
    }

    /// A built-in application name, or a path to a plugin.
    pub fn from_arg(arg: &str) -> Result<Self> {
        if let Some(app) = Self::builtin(arg) {
            return Ok(app);
        }
        let path = Path::new(arg);
        if !path.exists() {
            return Err(anyhow!("no built-in application or plugin named {}", arg));
        }
        Self::load(path)
    }
}
