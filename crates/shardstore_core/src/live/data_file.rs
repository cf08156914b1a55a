//! A data file in use by its channel.

use super::evaluator::FileMetrics;
use crate::files::StoredFile;
use crate::stats::FileStatistics;
use std::sync::Arc;

/// One of a channel's data files with its length accounting.
///
/// `total_length` counts every byte written, `content_length` only the
/// records of live entities; the difference is superseded or collected
/// data that a consolidation would reclaim.
#[derive(Debug, Clone)]
pub(crate) struct LiveDataFile {
    number: u64,
    file: Arc<StoredFile>,
    total_length: u64,
    content_length: u64,
}

impl LiveDataFile {
    pub(crate) fn new(number: u64, file: Arc<StoredFile>, total_length: u64) -> Self {
        Self {
            number,
            file,
            total_length,
            content_length: 0,
        }
    }

    pub(crate) const fn number(&self) -> u64 {
        self.number
    }

    pub(crate) fn file(&self) -> &Arc<StoredFile> {
        &self.file
    }

    pub(crate) const fn total_length(&self) -> u64 {
        self.total_length
    }

    pub(crate) const fn content_length(&self) -> u64 {
        self.content_length
    }

    pub(crate) fn grow(&mut self, length: u64) {
        self.total_length += length;
    }

    pub(crate) fn cut_to(&mut self, length: u64) {
        self.total_length = length;
        self.content_length = self.content_length.min(length);
    }

    pub(crate) fn add_content(&mut self, length: u64) {
        self.content_length = (self.content_length + length).min(self.total_length);
    }

    pub(crate) fn release_content(&mut self, length: u64) {
        self.content_length = self.content_length.saturating_sub(length);
    }

    pub(crate) fn metrics(&self, entity_count: usize, is_head: bool) -> FileMetrics {
        FileMetrics {
            total_length: self.total_length,
            content_length: self.content_length,
            single_entity: entity_count == 1,
            is_head,
        }
    }

    pub(crate) fn statistics(&self, entity_count: usize) -> FileStatistics {
        FileStatistics {
            number: self.number,
            path: self.file.path().to_path_buf(),
            file_length: self.total_length,
            live_data_length: self.content_length,
            entity_count: entity_count as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileNaming;
    use crate::files::{FileIdentity, StorageLayout};
    use shardstore_storage::InMemoryFileSystem;

    fn data_file() -> LiveDataFile {
        let fs = InMemoryFileSystem::new();
        let layout = StorageLayout::new("/store", FileNaming::default());
        let file = StoredFile::open(&fs, &layout, FileIdentity::data(0, 3)).unwrap();
        LiveDataFile::new(3, Arc::new(file), 0)
    }

    #[test]
    fn content_never_exceeds_total() {
        let mut file = data_file();
        file.grow(100);
        file.add_content(150);
        assert_eq!(file.content_length(), 100);
        file.release_content(30);
        assert_eq!(file.content_length(), 70);
        file.cut_to(50);
        assert_eq!(file.content_length(), 50);
        file.release_content(80);
        assert_eq!(file.content_length(), 0);
    }

    #[test]
    fn metrics_and_statistics() {
        let mut file = data_file();
        file.grow(200);
        file.add_content(50);
        let metrics = file.metrics(1, false);
        assert!(metrics.single_entity);
        assert!((metrics.fill_ratio() - 0.25).abs() < f64::EPSILON);

        let statistics = file.statistics(1);
        assert_eq!(statistics.number, 3);
        assert_eq!(statistics.file_length, 200);
        assert!(statistics.path.ends_with("channel_0_3.dat"));
    }
}
