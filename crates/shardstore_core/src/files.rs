//! Storage directory layout and shared file handles.
//!
//! [`StorageLayout`] maps channel files to paths and back. [`StoredFile`] is
//! an open data file or transactions log shared between its channel and
//! the threads that read it asynchronously (backup, export), with a usage
//! register deciding when it may be deleted.

use crate::config::FileNaming;
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use shardstore_storage::{FileSystem, StorageBackend};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Which file of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileKind {
    /// Data file with the given number.
    Data(u64),
    /// The transactions log.
    Transactions,
}

/// Identity of a channel file, independent of the directory it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentity {
    /// Owning channel.
    pub channel: usize,
    /// Data file or transactions log.
    pub kind: FileKind,
}

impl FileIdentity {
    /// Identity of a data file.
    #[must_use]
    pub const fn data(channel: usize, number: u64) -> Self {
        Self {
            channel,
            kind: FileKind::Data(number),
        }
    }

    /// Identity of a transactions log.
    #[must_use]
    pub const fn transactions(channel: usize) -> Self {
        Self {
            channel,
            kind: FileKind::Transactions,
        }
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FileKind::Data(number) => write!(f, "channel {} data file {number}", self.channel),
            FileKind::Transactions => write!(f, "channel {} transactions log", self.channel),
        }
    }
}

/// Maps file identities to paths below a base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    base: PathBuf,
    naming: FileNaming,
}

/// Files found in one channel directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInventory {
    /// Data files by number, with their sizes.
    pub data_files: BTreeMap<u64, u64>,
    /// Size of the transactions log, if present.
    pub transactions_size: Option<u64>,
}

impl StorageLayout {
    /// Creates a layout.
    pub fn new(base: impl Into<PathBuf>, naming: FileNaming) -> Self {
        Self {
            base: base.into(),
            naming,
        }
    }

    /// The same naming below another base directory.
    #[must_use]
    pub fn with_base(&self, base: impl Into<PathBuf>) -> Self {
        Self::new(base, self.naming.clone())
    }

    /// The base directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of the lock file.
    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.base.join(&self.naming.lock_file_name)
    }

    /// Directory of `channel`.
    #[must_use]
    pub fn channel_directory(&self, channel: usize) -> PathBuf {
        self.base
            .join(format!("{}{channel}", self.naming.channel_directory_prefix))
    }

    /// File name of a data file.
    #[must_use]
    pub fn data_file_name(&self, channel: usize, number: u64) -> String {
        format!(
            "{}{channel}_{number}.{}",
            self.naming.data_file_prefix, self.naming.data_file_type
        )
    }

    /// File name of a transactions log.
    #[must_use]
    pub fn transactions_file_name(&self, channel: usize) -> String {
        format!(
            "{}{channel}.{}",
            self.naming.transactions_file_prefix, self.naming.transactions_file_type
        )
    }

    /// Path of a channel file.
    #[must_use]
    pub fn path(&self, identity: FileIdentity) -> PathBuf {
        let name = match identity.kind {
            FileKind::Data(number) => self.data_file_name(identity.channel, number),
            FileKind::Transactions => self.transactions_file_name(identity.channel),
        };
        self.channel_directory(identity.channel).join(name)
    }

    /// Parses a data file name of `channel`, returning its number.
    #[must_use]
    pub fn parse_data_file_name(&self, channel: usize, name: &str) -> Option<u64> {
        let prefix = format!("{}{channel}_", self.naming.data_file_prefix);
        let suffix = format!(".{}", self.naming.data_file_type);
        name.strip_prefix(&prefix)?
            .strip_suffix(&suffix)?
            .parse()
            .ok()
    }

    /// Lists the files of `channel`.
    ///
    /// Files that are neither data files nor the transactions log of the
    /// channel are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn inventory(&self, fs: &dyn FileSystem, channel: usize) -> CoreResult<ChannelInventory> {
        let mut inventory = ChannelInventory::default();
        let transactions_name = self.transactions_file_name(channel);
        for path in fs.list_files(&self.channel_directory(channel))? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == transactions_name {
                inventory.transactions_size = Some(fs.file_size(&path)?);
            } else if let Some(number) = self.parse_data_file_name(channel, name) {
                inventory.data_files.insert(number, fs.file_size(&path)?);
            } else {
                debug!(channel, file = %path.display(), "ignoring unrelated file");
            }
        }
        Ok(inventory)
    }
}

/// A logical user keeping a file alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileUser {
    /// The owning channel.
    Channel,
    /// The backup thread, between enqueue and application of an item.
    Backup,
    /// A running export.
    Export,
}

/// An open channel file shared across threads.
pub struct StoredFile {
    identity: FileIdentity,
    path: PathBuf,
    backend: Mutex<Box<dyn StorageBackend>>,
    users: Mutex<HashMap<FileUser, u32>>,
}

impl fmt::Debug for StoredFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredFile")
            .field("identity", &self.identity)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl StoredFile {
    /// Opens (creating if needed) the file of `identity` below `layout`,
    /// registered for its channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(fs: &dyn FileSystem, layout: &StorageLayout, identity: FileIdentity) -> CoreResult<Self> {
        let path = layout.path(identity);
        let backend = fs.open(&path)?;
        Ok(Self {
            identity,
            path,
            backend: Mutex::new(backend),
            users: Mutex::new(HashMap::from([(FileUser::Channel, 1)])),
        })
    }

    /// Which channel file this is.
    #[must_use]
    pub const fn identity(&self) -> FileIdentity {
        self.identity
    }

    /// Where the file lives.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is outside the file.
    pub fn read_at(&self, offset: u64, len: u64) -> CoreResult<Vec<u8>> {
        let len = usize::try_from(len)
            .map_err(|_| CoreError::consistency(format!("read of {len} bytes from {}", self.identity)))?;
        Ok(self.backend.lock().read_at(offset, len)?)
    }

    /// Reads the whole file.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub fn read_all(&self) -> CoreResult<Vec<u8>> {
        let backend = self.backend.lock();
        let size = backend.size()?;
        let len = usize::try_from(size)
            .map_err(|_| CoreError::consistency(format!("{} too large to read", self.identity)))?;
        Ok(backend.read_at(0, len)?)
    }

    /// Current size.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Runs `f` with exclusive access to the backend.
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut dyn StorageBackend) -> R) -> R {
        let mut backend = self.backend.lock();
        f(backend.as_mut())
    }

    /// Registers one more use by `user`.
    pub fn register_user(&self, user: FileUser) {
        *self.users.lock().entry(user).or_insert(0) += 1;
    }

    /// Releases one use by `user`.
    pub fn release_user(&self, user: FileUser) {
        let mut users = self.users.lock();
        if let Some(count) = users.get_mut(&user) {
            *count -= 1;
            if *count == 0 {
                users.remove(&user);
            }
        }
    }

    /// Returns true if a user other than the channel holds the file.
    #[must_use]
    pub fn has_foreign_users(&self) -> bool {
        self.users.lock().keys().any(|user| *user != FileUser::Channel)
    }
}
