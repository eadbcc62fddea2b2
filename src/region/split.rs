//! Split and merge transactions.
//!
//! Both are journal-backed two-phase transactions over the file system.
//! Before the point of no return (PONR) every step is undoable: rollback
//! deletes the daughter directories and re-opens the parent. Once the PONR
//! journal entry lands the transaction only moves forward; a crash between
//! PONR and completion is recovered by re-opening the daughters.
//!
//! Daughters never copy data. They start with reference files pointing at
//! the parent's files (bottom/top halves for a split, whole files for a
//! merge); the next compaction rewrites references into concrete files,
//! after which `has_references` turns false and the external janitor may
//! archive the parent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use super::info::{RegionInfo, RegionState};
use super::Region;
use crate::error::Result;
use crate::fs::{ReferenceFile, ReferenceSide, RegionFileSystem};
use crate::Error;

const SPLIT_JOURNAL: &str = "split.journal";
const MERGE_JOURNAL: &str = "merge.journal";

/// Journal entries. The PONR entry is the durable commit point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    Started { split_row: Vec<u8> },
    DaughtersCreated { daughters: Vec<String> },
    PointOfNoReturn,
    Completed,
    RolledBack,
}

fn append_journal(path: &PathBuf, entry: &JournalEntry) -> Result<()> {
    use std::io::Write;
    let bytes = bincode::serialize(entry)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_u32::<BigEndian>(bytes.len() as u32)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

pub fn read_journal(path: &PathBuf) -> Result<Vec<JournalEntry>> {
    use std::io::Read;
    let mut entries = Vec::new();
    let Ok(mut file) = std::fs::File::open(path) else {
        return Ok(entries);
    };
    loop {
        let len = match file.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(_) => break,
        };
        let mut bytes = vec![0u8; len];
        if file.read_exact(&mut bytes).is_err() {
            break;
        }
        entries.push(bincode::deserialize(&bytes)?);
    }
    Ok(entries)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Splits an OPEN region at `split_row`, returning the two daughters.
/// The parent ends in the terminal SPLIT state.
pub fn split_region(
    parent: &Arc<Region>,
    split_row: Vec<u8>,
) -> Result<(Arc<Region>, Arc<Region>)> {
    let info = parent.info().clone();
    if !info.contains_row(&split_row) || split_row == info.start_key {
        return Err(Error::InvalidInput(format!(
            "split row {:?} not strictly inside the region range",
            String::from_utf8_lossy(&split_row)
        )));
    }
    if parent.state() != RegionState::Open {
        return Err(Error::RegionNotOnline(format!(
            "cannot split region in state {:?}",
            parent.state()
        )));
    }
    parent
        .hooks()
        .invoke(|obs, ctx| obs.pre_split(ctx, &split_row))?;

    // Quiesce: no new writes land once the state leaves OPEN; flush so the
    // daughters inherit everything through files.
    parent.set_state(RegionState::Splitting);
    parent.flush()?;

    let journal_path = parent.filesystem().region_dir().join(SPLIT_JOURNAL);
    append_journal(&journal_path, &JournalEntry::Started {
        split_row: split_row.clone(),
    })?;
    parent
        .hooks()
        .invoke(|obs, ctx| obs.pre_split_before_ponr(ctx))?;

    let families: Vec<_> = parent
        .stores()
        .map(|(_, store)| store.family().clone())
        .collect();
    let daughter_a = RegionInfo::new(
        info.namespace.clone(),
        info.table.clone(),
        info.start_key.clone(),
        split_row.clone(),
        now_millis(),
    );
    let daughter_b = RegionInfo::new(
        info.namespace.clone(),
        info.table.clone(),
        split_row.clone(),
        info.end_key.clone(),
        now_millis() + 1,
    );

    // Before-PONR: daughter directories and reference files. Any failure
    // here rolls back.
    let before_ponr = (|| {
        for (daughter, side) in [
            (&daughter_a, ReferenceSide::Bottom),
            (&daughter_b, ReferenceSide::Top),
        ] {
            let daughter_fs = RegionFileSystem::new(parent.config().root_dir.as_path(), daughter);
            let family_names: Vec<Vec<u8>> =
                families.iter().map(|f| f.name.clone()).collect();
            daughter_fs.create(daughter, &family_names)?;
            for (name, store) in parent.stores() {
                for file in store.files() {
                    // A reference to a reference is never created; splits
                    // require the parent to be fully compacted first.
                    if file.reference.is_some() {
                        return Err(Error::InvalidInput(
                            "cannot split a region that still has references".to_string(),
                        ));
                    }
                    daughter_fs.create_reference_file(
                        name,
                        &ReferenceFile {
                            parent_namespace: info.namespace.clone(),
                            parent_table: info.table.clone(),
                            parent_region: parent.filesystem().encoded_name().to_string(),
                            parent_file_id: file.id,
                            split_row: split_row.clone(),
                            side,
                        },
                    )?;
                }
            }
        }
        Ok::<_, Error>(())
    })();

    if let Err(e) = before_ponr {
        rollback_split(parent, &daughter_a, &daughter_b, &journal_path)?;
        return Err(e);
    }
    append_journal(&journal_path, &JournalEntry::DaughtersCreated {
        daughters: vec![daughter_a.encoded_name(), daughter_b.encoded_name()],
    })?;

    // PONR: from here the daughters are authoritative and recovery only
    // moves forward.
    append_journal(&journal_path, &JournalEntry::PointOfNoReturn)?;
    parent.set_state(RegionState::Split);
    parent
        .hooks()
        .invoke(|obs, ctx| obs.pre_split_after_ponr(ctx))?;

    let open_daughter = |info: RegionInfo| {
        Region::open(
            info,
            families.clone(),
            parent.config().clone(),
            parent.cache().clone(),
            parent.wal_handle().clone(),
            parent.memory_handle().clone(),
            parent.hooks().clone(),
        )
    };
    let a = open_daughter(daughter_a)?;
    let b = open_daughter(daughter_b)?;

    append_journal(&journal_path, &JournalEntry::Completed)?;
    parent.hooks().invoke(|obs, ctx| obs.post_split(ctx))?;
    tracing::info!(
        parent = %String::from_utf8_lossy(&parent.name()),
        split_row = %String::from_utf8_lossy(&split_row),
        "split region"
    );
    Ok((a, b))
}

fn rollback_split(
    parent: &Arc<Region>,
    daughter_a: &RegionInfo,
    daughter_b: &RegionInfo,
    journal_path: &PathBuf,
) -> Result<()> {
    for daughter in [daughter_a, daughter_b] {
        let fs = RegionFileSystem::new(parent.config().root_dir.as_path(), daughter);
        fs.remove_region_dir()?;
    }
    append_journal(journal_path, &JournalEntry::RolledBack)?;
    parent.set_state(RegionState::Open);
    parent
        .hooks()
        .invoke(|obs, ctx| obs.post_rollback_split(ctx))?;
    Ok(())
}

/// Merges two OPEN regions of one table into a new region covering both
/// ranges. Both parents end MERGED.
pub fn merge_regions(a: &Arc<Region>, b: &Arc<Region>) -> Result<Arc<Region>> {
    if a.name() == b.name() {
        return Err(Error::MergeRegion("cannot merge a region with itself".to_string()));
    }
    if a.info().table != b.info().table || a.info().namespace != b.info().namespace {
        return Err(Error::MergeRegion("regions belong to different tables".to_string()));
    }
    for region in [a, b] {
        if region.state() != RegionState::Open {
            return Err(Error::MergeRegion(format!(
                "region {:?} is {:?}, not OPEN",
                String::from_utf8_lossy(&region.name()),
                region.state()
            )));
        }
    }
    a.hooks().invoke(|obs, ctx| obs.pre_merge(ctx))?;

    // Order the parents by start key; the merged range spans both.
    let (low, high) = if a.info().start_key <= b.info().start_key {
        (a, b)
    } else {
        (b, a)
    };

    low.set_state(RegionState::Merging);
    high.set_state(RegionState::Merging);
    low.flush()?;
    high.flush()?;

    let merged_info = RegionInfo::new(
        low.info().namespace.clone(),
        low.info().table.clone(),
        low.info().start_key.clone(),
        high.info().end_key.clone(),
        now_millis(),
    );
    let families: Vec<_> = low
        .stores()
        .map(|(_, store)| store.family().clone())
        .collect();
    let merged_fs = RegionFileSystem::new(low.config().root_dir.as_path(), &merged_info);
    let journal_path = merged_fs.region_dir().join(MERGE_JOURNAL);

    let before_ponr = (|| {
        let family_names: Vec<Vec<u8>> = families.iter().map(|f| f.name.clone()).collect();
        merged_fs.create(&merged_info, &family_names)?;
        append_journal(&journal_path, &JournalEntry::Started { split_row: vec![] })?;
        for parent in [low, high] {
            for (name, store) in parent.stores() {
                for file in store.files() {
                    if file.reference.is_some() {
                        return Err(Error::MergeRegion(
                            "cannot merge a region that still has references".to_string(),
                        ));
                    }
                    // A whole-file reference: the top half starting at the
                    // parent's start key covers every row the parent holds.
                    merged_fs.create_reference_file(
                        name,
                        &ReferenceFile {
                            parent_namespace: parent.info().namespace.clone(),
                            parent_table: parent.info().table.clone(),
                            parent_region: parent.filesystem().encoded_name().to_string(),
                            parent_file_id: file.id,
                            split_row: parent.info().start_key.clone(),
                            side: ReferenceSide::Top,
                        },
                    )?;
                }
            }
        }
        Ok::<_, Error>(())
    })();

    if let Err(e) = before_ponr {
        merged_fs.remove_region_dir()?;
        low.set_state(RegionState::Open);
        high.set_state(RegionState::Open);
        low.hooks().invoke(|obs, ctx| obs.post_rollback_merge(ctx))?;
        return Err(e);
    }

    append_journal(&journal_path, &JournalEntry::PointOfNoReturn)?;
    low.set_state(RegionState::Merged);
    high.set_state(RegionState::Merged);
    low.hooks().invoke(|obs, ctx| obs.pre_merge_after_ponr(ctx))?;

    let merged = Region::open(
        merged_info,
        families,
        low.config().clone(),
        low.cache().clone(),
        low.wal_handle().clone(),
        low.memory_handle().clone(),
        low.hooks().clone(),
    )?;

    append_journal(&journal_path, &JournalEntry::Completed)?;
    low.hooks().invoke(|obs, ctx| obs.post_merge(ctx))?;
    tracing::info!(
        merged = %String::from_utf8_lossy(&merged.name()),
        "merged regions"
    );
    Ok(merged)
}
