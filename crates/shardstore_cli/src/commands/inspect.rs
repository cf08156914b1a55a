//! Inspect command implementation.

use super::{format_size, CliError, StorageDirectory};
use crate::Format;
use serde::Serialize;
use shardstore_core::{FileIdentity, RecordIter, RecordKind};
use shardstore_storage::FileSystem;
use std::collections::BTreeMap;
use std::path::Path;

/// Storage inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Storage path.
    pub path: String,
    /// Total size of all data files and logs in bytes.
    pub total_size: u64,
    /// Per-channel details.
    pub channels: Vec<ChannelReport>,
}

/// One channel directory.
#[derive(Debug, Serialize)]
pub struct ChannelReport {
    /// Channel index.
    pub channel: usize,
    /// Size of the transactions log, if present.
    pub transactions_size: Option<u64>,
    /// Number of log entries.
    pub transactions_entries: usize,
    /// Head file according to the log.
    pub head_file: Option<u64>,
    /// Data files present, ascending by number.
    pub files: Vec<DataFileReport>,
}

/// One data file.
#[derive(Debug, Serialize)]
pub struct DataFileReport {
    /// File number.
    pub number: u64,
    /// Size on disk.
    pub size: u64,
    /// Length according to the log.
    pub logged_length: Option<u64>,
    /// Entity records, current or superseded.
    pub entity_records: usize,
    /// Bytes of entity records.
    pub entity_bytes: u64,
    /// Bytes of gap records.
    pub gap_bytes: u64,
    /// First undecodable offset, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unreadable_at: Option<u64>,
    /// Entity records per type ID (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub types: Option<BTreeMap<u64, usize>>,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_types: bool, format: Format) -> Result<(), CliError> {
    let result = inspect(path, show_types)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

/// Collects the inspection result.
pub fn inspect(path: &Path, show_types: bool) -> Result<InspectResult, CliError> {
    let directory = StorageDirectory::open(path)?;
    let mut result = InspectResult {
        path: path.display().to_string(),
        total_size: 0,
        channels: Vec::new(),
    };

    for &channel in &directory.channels {
        let inventory = directory.layout.inventory(&directory.fs, channel)?;
        let analysis = directory.analysis(channel)?;
        let mut report = ChannelReport {
            channel,
            transactions_size: inventory.transactions_size,
            transactions_entries: analysis.as_ref().map_or(0, |a| a.entry_count()),
            head_file: analysis.as_ref().and_then(|a| a.head_file_number()),
            files: Vec::new(),
        };
        result.total_size += inventory.transactions_size.unwrap_or(0);

        for (&number, &size) in &inventory.data_files {
            let bytes = directory.fs.read_all(&directory.layout.path(FileIdentity::data(channel, number)))?;
            let mut file = scan(&bytes, show_types);
            file.number = number;
            file.size = size;
            file.logged_length = analysis
                .as_ref()
                .and_then(|a| a.files().get(&number))
                .filter(|logged| !logged.deleted)
                .map(|logged| logged.length);
            result.total_size += size;
            report.files.push(file);
        }
        result.channels.push(report);
    }
    Ok(result)
}

fn scan(bytes: &[u8], show_types: bool) -> DataFileReport {
    let mut report = DataFileReport {
        number: 0,
        size: bytes.len() as u64,
        logged_length: None,
        entity_records: 0,
        entity_bytes: 0,
        gap_bytes: 0,
        unreadable_at: None,
        types: show_types.then(BTreeMap::new),
    };
    let mut offset = 0;
    for record in RecordIter::new(bytes, 0) {
        let Ok(record) = record else {
            report.unreadable_at = Some(offset);
            break;
        };
        offset = record.offset + record.length();
        match record.kind {
            RecordKind::Entity(header) => {
                report.entity_records += 1;
                report.entity_bytes += header.length;
                if let Some(types) = report.types.as_mut() {
                    *types.entry(header.type_id.0).or_insert(0) += 1;
                }
            }
            RecordKind::Gap(length) => report.gap_bytes += length,
        }
    }
    report
}

fn print_text_output(result: &InspectResult) {
    println!("shardstore Storage Inspection");
    println!("=============================");
    println!();
    println!("Path:       {}", result.path);
    println!("Channels:   {}", result.channels.len());
    println!("Total size: {}", format_size(result.total_size));

    for channel in &result.channels {
        println!();
        println!("Channel {}:", channel.channel);
        match channel.transactions_size {
            Some(size) => println!(
                "  Transactions log: {} ({} entries)",
                format_size(size),
                channel.transactions_entries
            ),
            None => println!("  Transactions log: missing"),
        }
        if let Some(head) = channel.head_file {
            println!("  Head file:        {head}");
        }
        for file in &channel.files {
            let logged = file
                .logged_length
                .map_or_else(|| "unlogged".to_owned(), |length| format!("logged {length}"));
            println!(
                "  [{}] {} ({logged}): {} entities, {} live bytes, {} gap bytes",
                file.number,
                format_size(file.size),
                file.entity_records,
                file.entity_bytes,
                file.gap_bytes
            );
            if let Some(offset) = file.unreadable_at {
                println!("      unreadable from offset {offset}");
            }
            if let Some(types) = &file.types {
                for (type_id, count) in types {
                    println!("      type {type_id}: {count}");
                }
            }
        }
    }
}
