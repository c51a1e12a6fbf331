/// HLS切片目录 (Segment directory)
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::Result;

/// 管理编码器输出目录: 创建, 列举, 清理旧切片
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
    playlist_name: String,
}

impl SegmentStore {
    pub fn new(dir: impl Into<PathBuf>, playlist_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            playlist_name: playlist_name.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.dir.join(&self.playlist_name)
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn is_artifact(&self, path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => {
                ext.eq_ignore_ascii_case("ts")
                    || ext.eq_ignore_ascii_case("m3u8")
                    || ext.eq_ignore_ascii_case("tmp")
            }
            None => false,
        }
    }

    /// 目录中的播放列表和切片, 按文件名排序
    pub fn artifacts(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| self.is_artifact(p))
            .collect();
        files.sort();
        Ok(files)
    }

    /// 删除所有切片和播放列表, 返回删除数量
    ///
    /// 单个文件删除失败只记录日志, 继续处理其余文件
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.artifacts()? {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("⚠️ 删除 {} 失败: {}", path.display(), e),
            }
        }
        if removed > 0 {
            info!("🧹 已清理 {} 个HLS文件 ({})", removed, self.dir.display());
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_removes_only_hls_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path(), "stream.m3u8");
        for name in ["stream.m3u8", "segment_00000.ts", "segment_00001.ts", "keep.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("nested.ts")).unwrap();

        assert_eq!(store.artifacts().unwrap().len(), 3);
        assert_eq!(store.clear().unwrap(), 3);
        assert!(store.artifacts().unwrap().is_empty());
        assert!(dir.path().join("keep.txt").exists());
        assert!(dir.path().join("nested.ts").is_dir());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path().join("hls"), "stream.m3u8");
        assert!(store.artifacts().unwrap().is_empty());
        assert_eq!(store.clear().unwrap(), 0);

        store.ensure_dir().unwrap();
        assert!(store.dir().is_dir());
        assert_eq!(store.playlist_path(), dir.path().join("hls").join("stream.m3u8"));
    }
}
