/// 权重目录 (Model catalog)
///
/// 每次调用都重新读取目录, 不缓存
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::error::{Result, StreamError};

/// 当前模型 + 可选模型
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSelection {
    #[serde(rename = "current_model")]
    pub current: String,
    #[serde(rename = "models")]
    pub available: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    dir: PathBuf,
    extensions: Vec<String>,
}

impl ModelCatalog {
    pub fn new(dir: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            dir: dir.into(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    fn has_model_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// 目录中的模型文件名; 目录不存在时为空
    pub fn list(&self) -> Result<BTreeSet<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("⚠️ 模型目录不存在: {}", self.dir.display());
                return Ok(BTreeSet::new());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && self.has_model_extension(p))
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect())
    }

    /// 只接受目录内的纯文件名
    pub fn validate_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(StreamError::InvalidArgument("model name must not be empty".to_string()));
        }
        if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
            return Err(StreamError::InvalidArgument(format!(
                "model name must be a plain file name: {}",
                name
            )));
        }
        Ok(())
    }

    /// 校验名称并确认其在当前目录列表中
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        if !self.list()?.contains(name) {
            return Err(StreamError::NotFound(format!(
                "model {} not found in {}",
                name,
                self.dir.display()
            )));
        }
        Ok(self.path_of(name))
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn selection(&self, current: &str) -> Result<ModelSelection> {
        Ok(ModelSelection {
            current: current.to_string(),
            available: self.list()?,
        })
    }
}
