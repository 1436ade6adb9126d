//! 键值存储
//!
//! 宿主只提供"按键读写一个 JSON 值"的能力，这里给出内存实现和单文件 JSON 实现。

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// 键值存储
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> EngineResult<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> EngineResult<()>;
}

/// 内存存储（测试和不需要落盘的场景）
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> EngineResult<()> {
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }
}

/// 单文件 JSON 存储
///
/// 所有键保存在一个 JSON 对象里；每次写入整体落盘（先写临时文件再重命名）
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    /// 打开存储文件，不存在时从空对象开始
    pub fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Map::new()
            } else {
                match serde_json::from_str::<Value>(&content)? {
                    Value::Object(map) => map,
                    other => {
                        return Err(EngineError::Persistence(format!(
                            "状态文件格式错误，期望 JSON 对象: {} ({})",
                            path.display(),
                            type_name(&other)
                        )))
                    }
                }
            }
        } else {
            debug!("状态文件不存在，使用空存储: {}", path.display());
            Map::new()
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, data: &Map<String, Value>) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            warn!("重命名状态文件失败: {}, error={}", self.path.display(), e);
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> EngineResult<()> {
        let mut data = self.data.lock();
        data.insert(key.to_string(), value);
        self.flush(&data)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.get("k").unwrap().is_none());
        store.set("k", json!([1, 2])).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!([1, 2])));
    }

    #[test]
    fn test_json_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/plugin.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set("processed_list", json!(["/a.mkv"])).unwrap();
        store.set("favor", json!({"121659": true})).unwrap();
        assert!(path.exists());

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("processed_list").unwrap(),
            Some(json!(["/a.mkv"]))
        );
        assert_eq!(reopened.get("favor").unwrap(), Some(json!({"121659": true})));
        assert!(reopened.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_json_file_store_rejects_non_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        assert!(matches!(
            JsonFileStore::open(&path),
            Err(EngineError::Persistence(_))
        ));
    }

    #[test]
    fn test_json_file_store_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.get("anything").unwrap().is_none());
    }
}
