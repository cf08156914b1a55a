//! Verify command implementation.
//!
//! Checks what a restart would check: the transactions log replays, every
//! logged file has its logged length and every record up to that length
//! decodes. Conditions a restart repairs on its own are warnings.

use super::{CliError, StorageDirectory};
use crate::Format;
use serde::Serialize;
use shardstore_core::{FileIdentity, RecordIter};
use shardstore_storage::FileSystem;
use std::path::Path;

/// A problem found in a channel.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    /// Channel the problem was found in.
    pub channel: usize,
    /// Data file concerned, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<u64>,
    /// What is wrong.
    pub message: String,
}

/// Verification result.
#[derive(Debug, Default, Serialize)]
pub struct VerifyResult {
    /// Number of channels checked.
    pub channels_checked: usize,
    /// Number of data files checked.
    pub files_checked: usize,
    /// Number of entity and gap records decoded.
    pub records_checked: usize,
    /// Problems a restart would fail on.
    pub errors: Vec<Finding>,
    /// Problems a restart repairs.
    pub warnings: Vec<Finding>,
}

impl VerifyResult {
    fn error(&mut self, channel: usize, file: Option<u64>, message: impl Into<String>) {
        self.errors.push(Finding {
            channel,
            file,
            message: message.into(),
        });
    }

    fn warn(&mut self, channel: usize, file: Option<u64>, message: impl Into<String>) {
        self.warnings.push(Finding {
            channel,
            file,
            message: message.into(),
        });
    }

    /// Returns true if nothing would stop a restart.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, channel: Option<usize>, format: Format) -> Result<(), CliError> {
    let result = verify(path, channel)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(path, &result),
    }
    if result.is_ok() {
        Ok(())
    } else {
        Err(CliError::VerificationFailed(result.errors.len()))
    }
}

/// Checks every channel, or only `only`.
pub fn verify(path: &Path, only: Option<usize>) -> Result<VerifyResult, CliError> {
    let directory = StorageDirectory::open(path)?;
    let channels = match only {
        Some(channel) => {
            directory.require(channel)?;
            vec![channel]
        }
        None => directory.channels.clone(),
    };
    let mut result = VerifyResult::default();
    for channel in channels {
        verify_channel(&directory, channel, &mut result)?;
        result.channels_checked += 1;
    }
    Ok(result)
}

fn verify_channel(directory: &StorageDirectory, channel: usize, result: &mut VerifyResult) -> Result<(), CliError> {
    let inventory = directory.layout.inventory(&directory.fs, channel)?;
    let analysis = match directory.analysis(channel) {
        Ok(Some(analysis)) => analysis,
        Ok(None) => {
            if !inventory.data_files.is_empty() {
                result.warn(channel, None, "transactions log missing, it will be derived from the data files");
            }
            return Ok(());
        }
        Err(CliError::Core(e)) => {
            result.error(channel, None, format!("transactions log unreadable: {e}"));
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let head = analysis.head_file_number();

    for (&number, &size) in &inventory.data_files {
        result.files_checked += 1;
        let Some(logged) = analysis.files().get(&number) else {
            if size == 0 {
                result.warn(channel, Some(number), "empty file not in the log");
            } else {
                result.error(channel, Some(number), format!("{size} bytes not in the log"));
            }
            continue;
        };
        if logged.deleted {
            result.warn(channel, Some(number), "deleted in the log but still present");
            continue;
        }
        if size < logged.length {
            result.error(
                channel,
                Some(number),
                format!("length {size} is shorter than the logged {}", logged.length),
            );
        } else if size > logged.length && Some(number) == head {
            result.warn(
                channel,
                Some(number),
                format!("{} uncommitted bytes after the logged length", size - logged.length),
            );
        } else if size > logged.length {
            result.error(
                channel,
                Some(number),
                format!("length {size} differs from the logged {}", logged.length),
            );
        }

        let bytes = directory.fs.read_all(&directory.layout.path(FileIdentity::data(channel, number)))?;
        let end = usize::try_from(logged.length.min(size)).unwrap_or(bytes.len()).min(bytes.len());
        for record in RecordIter::new(&bytes[..end], 0) {
            match record {
                Ok(_) => result.records_checked += 1,
                Err(e) => {
                    result.error(channel, Some(number), format!("undecodable record: {e}"));
                    break;
                }
            }
        }
    }

    for (number, logged) in analysis.files() {
        if !logged.deleted && logged.length > 0 && !inventory.data_files.contains_key(number) {
            result.error(
                channel,
                Some(*number),
                format!("logged with length {} but missing", logged.length),
            );
        }
    }
    Ok(())
}

fn print_text_output(path: &Path, result: &VerifyResult) {
    println!("Verifying storage at {}", path.display());
    println!();
    println!("  Channels checked: {}", result.channels_checked);
    println!("  Files checked:    {}", result.files_checked);
    println!("  Records checked:  {}", result.records_checked);
    for (label, findings) in [("ERROR", &result.errors), ("WARN", &result.warnings)] {
        for finding in findings {
            match finding.file {
                Some(file) => println!("  {label} channel {} file {file}: {}", finding.channel, finding.message),
                None => println!("  {label} channel {}: {}", finding.channel, finding.message),
            }
        }
    }
    println!();
    if result.is_ok() {
        println!("Storage is consistent.");
    } else {
        println!("Storage has {} error(s).", result.errors.len());
    }
}
