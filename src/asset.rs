//! Asset libraries
//!
//! An asset library is a file (or an in-memory copy of one) that the engine
//! loads to make operators available. The host registers libraries once; the
//! session decides when they have to be (re)loaded.
//!
//! Loading prefers the file and falls back to the buffer. A library counts as
//! modified when its file's edit time differs from the one recorded at the
//! last load, except in sync mode where the attached engine owns the file.

use crate::engine::status::{RemoteResultExt, Step};
use crate::engine::strings::resolve_ordered;
use crate::engine::{RemoteEngine, ResultCode, SessionHandle};
use crate::error::{CookError, Result};
use crate::node::NodeKey;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Registry index of an asset library
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AssetId(pub u32);

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetId({})", self.0)
    }
}

/// Everything a worker needs to load a library
#[derive(Debug, Clone)]
pub struct LibrarySource {
    pub name: String,
    pub path: Option<PathBuf>,
    pub buffer: Arc<Vec<u8>>,
}

/// Result of a successful load
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedLibrary {
    pub operators: Vec<String>,
    pub edit_time: Option<DateTime<Utc>>,
}

/// One registered asset library
#[derive(Debug, Clone)]
pub struct AssetLibrary {
    pub id: AssetId,
    pub name: String,
    pub file_path: Option<PathBuf>,
    pub buffer: Arc<Vec<u8>>,
    /// File edit time at the last successful load
    pub last_edit_time: Option<DateTime<Utc>>,
    pub available_operators: Vec<String>,
    instantiated: HashSet<NodeKey>,
}

impl AssetLibrary {
    pub fn new(id: AssetId, name: impl Into<String>, file_path: Option<PathBuf>, buffer: Vec<u8>) -> Self {
        Self {
            id,
            name: name.into(),
            file_path,
            buffer: Arc::new(buffer),
            last_edit_time: None,
            available_operators: Vec::new(),
            instantiated: HashSet::new(),
        }
    }

    /// Whether the library has to be loaded before instantiating from it.
    ///
    /// `loaded` says whether the current session already holds it.
    pub fn needs_load(&self, loaded: bool, sync: bool) -> bool {
        if !loaded {
            return true;
        }
        let Some(path) = &self.file_path else {
            return false;
        };
        match file_edit_time(path) {
            None => false,
            Some(edit_time) => !sync && Some(edit_time) != self.last_edit_time,
        }
    }

    pub fn register(&mut self, node: NodeKey) {
        self.instantiated.insert(node);
    }

    pub fn unregister(&mut self, node: NodeKey) {
        self.instantiated.remove(&node);
    }

    pub fn is_instantiated(&self, node: NodeKey) -> bool {
        self.instantiated.contains(&node)
    }

    pub fn source(&self) -> LibrarySource {
        LibrarySource {
            name: self.name.clone(),
            path: self.file_path.clone(),
            buffer: Arc::clone(&self.buffer),
        }
    }

    /// Record a fresh load. Previously instantiated nodes belong to the old copy.
    pub fn apply_loaded(&mut self, loaded: LoadedLibrary) {
        self.available_operators = loaded.operators;
        self.last_edit_time = loaded.edit_time;
        self.instantiated.clear();
    }
}

/// Modification time of `path`, `None` if the file is missing
pub fn file_edit_time(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

/// Load a library into the session and list its operators.
///
/// The file is tried first. Any failure other than session loss falls back
/// to the in-memory buffer.
pub fn load_library(
    engine: &dyn RemoteEngine,
    session: &SessionHandle,
    source: &LibrarySource,
) -> Result<LoadedLibrary> {
    let mut library = None;
    if let Some(path) = &source.path {
        match engine.load_library_from_file(session, path).step(Step::LoadLibrary) {
            Ok(id) => library = Some(id),
            Err(e) if e.is_session_lost() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    "{}: loading {} failed ({}), trying in-memory copy",
                    source.name,
                    path.display(),
                    e
                );
            }
        }
    }

    let library = match library {
        Some(id) => id,
        None if source.buffer.is_empty() => {
            return Err(CookError::Remote {
                step: Step::LoadLibrary,
                code: ResultCode::CantLoadFile,
            }
            .with_context(format!("asset library '{}'", source.name)));
        }
        None => engine
            .load_library_from_buffer(session, &source.buffer)
            .step(Step::LoadLibrary)?,
    };

    let handles = engine
        .available_operators(session, library)
        .step(Step::ListOperators)?;
    let operators = resolve_ordered(engine, session, &handles)?;
    if operators.is_empty() {
        tracing::error!("{}: asset library has no operators", source.name);
    } else {
        tracing::debug!("{}: loaded {} operators", source.name, operators.len());
    }

    Ok(LoadedLibrary {
        operators,
        edit_time: source.path.as_deref().and_then(file_edit_time),
    })
}

/// All registered asset libraries
#[derive(Debug, Default)]
pub struct AssetRegistry {
    libraries: Vec<AssetLibrary>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a library. Registering an existing name replaces its sources.
    pub fn register(&mut self, name: &str, file_path: Option<PathBuf>, buffer: Vec<u8>) -> AssetId {
        if let Some(library) = self.libraries.iter_mut().find(|l| l.name == name) {
            library.file_path = file_path;
            library.buffer = Arc::new(buffer);
            library.last_edit_time = None;
            return library.id;
        }
        let id = AssetId(self.libraries.len() as u32);
        self.libraries.push(AssetLibrary::new(id, name, file_path, buffer));
        id
    }

    pub fn get(&self, id: AssetId) -> Result<&AssetLibrary> {
        self.libraries
            .get(id.0 as usize)
            .ok_or(CookError::AssetNotFound(id.0))
    }

    pub fn get_mut(&mut self, id: AssetId) -> Result<&mut AssetLibrary> {
        self.libraries
            .get_mut(id.0 as usize)
            .ok_or(CookError::AssetNotFound(id.0))
    }

    pub fn find_by_name(&self, name: &str) -> Option<AssetId> {
        self.libraries.iter().find(|l| l.name == name).map(|l| l.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssetLibrary> {
        self.libraries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockCall, MockEngine, MockOperator};
    use crate::engine::{ServerOptions, SessionKind};
    use chrono::TimeZone;
    use std::io::Write;

    fn open(engine: &MockEngine) -> SessionHandle {
        let options = ServerOptions {
            auto_close: true,
            timeout_ms: 3000,
            shared_memory_buffer_mb: 512,
        };
        engine
            .start_server(SessionKind::SharedMemory, "assets", &options)
            .unwrap();
        engine
            .create_session(SessionKind::SharedMemory, "assets")
            .unwrap()
    }

    #[test]
    fn test_needs_load_rules() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"library").unwrap();

        let mut library = AssetLibrary::new(AssetId(0), "shapes", Some(file.path().to_path_buf()), Vec::new());
        assert!(library.needs_load(false, false));

        library.last_edit_time = file_edit_time(file.path());
        assert!(!library.needs_load(true, false));

        library.last_edit_time = Some(Utc.timestamp_opt(0, 0).unwrap());
        assert!(library.needs_load(true, false));
        assert!(!library.needs_load(true, true));

        library.file_path = Some(PathBuf::from("/definitely/missing.lib"));
        assert!(!library.needs_load(true, false));
    }

    #[test]
    fn test_load_prefers_file() {
        let engine = MockEngine::new()
            .with_library_file("/lib/shapes.lib", vec![MockOperator::new("Sop/sphere")]);
        let session = open(&engine);
        let library = AssetLibrary::new(AssetId(0), "shapes", Some("/lib/shapes.lib".into()), vec![1]);

        let loaded = load_library(&engine, &session, &library.source()).unwrap();
        assert_eq!(loaded.operators, vec!["Sop/sphere"]);
        assert_eq!(engine.call_count(MockCall::LoadLibraryBuffer), 0);
    }

    #[test]
    fn test_load_falls_back_to_buffer() {
        let engine = MockEngine::new()
            .with_library_buffer(vec![7, 7], vec![MockOperator::new("Sop/box")]);
        let session = open(&engine);
        let library = AssetLibrary::new(AssetId(0), "shapes", Some("/lib/moved.lib".into()), vec![7, 7]);

        let loaded = load_library(&engine, &session, &library.source()).unwrap();
        assert_eq!(loaded.operators, vec!["Sop/box"]);
        assert_eq!(engine.call_count(MockCall::LoadLibraryFile), 1);
    }

    #[test]
    fn test_load_without_any_source_fails() {
        let engine = MockEngine::new();
        let session = open(&engine);
        let library = AssetLibrary::new(AssetId(0), "empty", None, Vec::new());
        let err = load_library(&engine, &session, &library.source()).unwrap_err();
        assert!(!err.is_session_lost());
        assert_eq!(err.step(), Some(Step::LoadLibrary));
    }

    #[test]
    fn test_registry_reregister_keeps_id() {
        let mut registry = AssetRegistry::new();
        let a = registry.register("shapes", None, vec![1]);
        let b = registry.register("shapes", Some("/lib/shapes.lib".into()), Vec::new());
        assert_eq!(a, b);
        assert!(registry.get(a).unwrap().file_path.is_some());
        assert!(matches!(registry.get(AssetId(9)), Err(CookError::AssetNotFound(9))));
    }

    #[test]
    fn test_apply_loaded_clears_instantiated() {
        let mut library = AssetLibrary::new(AssetId(0), "shapes", None, Vec::new());
        library.register(NodeKey(1));
        assert!(library.is_instantiated(NodeKey(1)));
        library.apply_loaded(LoadedLibrary {
            operators: vec!["Sop/sphere".into()],
            edit_time: None,
        });
        assert!(!library.is_instantiated(NodeKey(1)));
    }
}
