//! Snapshot load/store for the chunk registry (spec §6.1).
//!
//! Three on-disk layouts are supported: `0x10` and `0x11` (legacy, no
//! flags/pairs block) and `0x12` (current, carries flags and the
//! file-count-list pairs inline). The loader always reads all three; the
//! writer always emits `0x12`. A leading version byte picks the format —
//! spec.md's own format table doesn't say where `mver` lives on disk, so
//! this is this module's own choice (see DESIGN.md).

use std::io::{Read, Write};

use anyhow::{bail, Context, Result};

use crate::chunk::{ChunkFlags, ChunkRecord, StorageMode};
use crate::file_count::FileCountArena;
use crate::ids::{ChunkId, SclassId};

pub const MVER_LEGACY_10: u8 = 0x10;
pub const MVER_LEGACY_11: u8 = 0x11;
pub const MVER_CURRENT: u8 = 0x12;

const ALLOW_READ_ZEROS_BIT: u32 = 0x8000_0000;
const OVERFLOW_PAIRS_BIT: u8 = 0x80;
const FLAG_ARCH: u8 = 0x01;
const FLAG_TRASH: u8 = 0x02;

fn write_u64(w: &mut impl Write, v: u64) -> Result<()> {
    w.write_all(&v.to_be_bytes()).context("write u64")
}
fn write_u32(w: &mut impl Write, v: u32) -> Result<()> {
    w.write_all(&v.to_be_bytes()).context("write u32")
}
fn write_u8(w: &mut impl Write, v: u8) -> Result<()> {
    w.write_all(&[v]).context("write u8")
}
fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).context("read u64")?;
    Ok(u64::from_be_bytes(buf))
}
fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).context("read u32")?;
    Ok(u32::from_be_bytes(buf))
}
fn read_u24(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 3];
    r.read_exact(&mut buf).context("read u24")?;
    Ok(((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32)
}
fn write_u24(w: &mut impl Write, v: u32) -> Result<()> {
    let b = v.to_be_bytes();
    w.write_all(&[b[1], b[2], b[3]]).context("write u24")
}
fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).context("read u8")?;
    Ok(buf[0])
}

/// Write a full snapshot: format version, `next_chunk_id`, every live
/// chunk record, then the sentinel.
pub fn write_snapshot<'a>(
    w: &mut impl Write,
    next_chunk_id: u64,
    records: impl Iterator<Item = &'a ChunkRecord>,
    file_count: &FileCountArena,
) -> Result<()> {
    write_u8(w, MVER_CURRENT)?;
    write_u64(w, next_chunk_id)?;
    for c in records {
        write_record(w, c, file_count)?;
    }
    // sentinel: chunk_id=0, version=0, locked_to=0, flags=0, pairs=0
    write_u64(w, 0)?;
    write_u32(w, 0)?;
    write_u32(w, 0)?;
    write_u8(w, 0)?;
    write_u8(w, 0)?;
    Ok(())
}

fn write_record(w: &mut impl Write, c: &ChunkRecord, file_count: &FileCountArena) -> Result<()> {
    write_u64(w, c.chunk_id.0)?;
    let mut version = c.version & 0x7FFF_FFFF;
    if c.flags.allow_read_zeros {
        version |= ALLOW_READ_ZEROS_BIT;
    }
    write_u32(w, version)?;
    write_u32(w, c.locked_to.max(0) as u32)?;

    let entries = file_count.entries(c.file_head, c.sclass_id);
    let mut flags_byte = 0u8;
    if c.flags.arch {
        flags_byte |= FLAG_ARCH;
    }
    if c.flags.trash {
        flags_byte |= FLAG_TRASH;
    }
    if entries.len() >= 256 {
        flags_byte |= OVERFLOW_PAIRS_BIT;
    }
    write_u8(w, flags_byte)?;
    write_u8(w, (entries.len().min(255)) as u8)?;

    for (sclass, fcount) in entries.iter().take(255) {
        write_u8(w, sclass.0)?;
        write_u24(w, *fcount)?;
    }
    if entries.len() > 1 {
        write_u8(w, c.sclass_id.0)?;
    }
    Ok(())
}

pub struct LoadedSnapshot {
    pub next_chunk_id: u64,
    pub records: Vec<ChunkRecord>,
    pub file_count: FileCountArena,
}

/// Load a snapshot in any of the three supported formats.
pub fn read_snapshot(r: &mut impl Read) -> Result<LoadedSnapshot> {
    let mver = read_u8(r)?;
    if ![MVER_LEGACY_10, MVER_LEGACY_11, MVER_CURRENT].contains(&mver) {
        bail!("unsupported snapshot format 0x{mver:02x}");
    }
    let next_chunk_id = read_u64(r)?;
    let mut records = Vec::new();
    let mut file_count = FileCountArena::new();

    loop {
        let chunk_id = read_u64(r)?;
        let raw_version = read_u32(r)?;
        let locked_to = read_u32(r)?;
        let (flags_byte, pairs_count) = if mver == MVER_CURRENT {
            let f = read_u8(r)?;
            let p = read_u8(r)?;
            (f, p)
        } else {
            (0u8, 0u8)
        };

        if chunk_id == 0 && raw_version == 0 && locked_to == 0 && flags_byte == 0 {
            break; // sentinel
        }

        let version = raw_version & 0x7FFF_FFFF;
        let allow_read_zeros = raw_version & ALLOW_READ_ZEROS_BIT != 0;

        let mut record = ChunkRecord::new(ChunkId(chunk_id), version, SclassId(0));
        record.locked_to = locked_to as i64;
        record.flags = ChunkFlags {
            arch: flags_byte & FLAG_ARCH != 0,
            trash: flags_byte & FLAG_TRASH != 0,
            allow_read_zeros,
            ..ChunkFlags::default()
        };
        record.storage_mode = StorageMode::Copies;

        let mut fh = 0u32;
        let mut head_sclass = SclassId(0);
        if mver == MVER_CURRENT && pairs_count > 0 {
            let mut pairs = Vec::with_capacity(pairs_count as usize);
            for _ in 0..pairs_count {
                let sclass = SclassId(read_u8(r)?);
                let fcount = read_u24(r)?;
                pairs.push((sclass, fcount));
            }
            let calculated_sclass = if pairs_count > 1 {
                SclassId(read_u8(r)?)
            } else {
                pairs[0].0
            };
            for (sclass, fcount) in pairs {
                for _ in 0..fcount {
                    let (a, b) = file_count.add_file(fh, head_sclass, sclass);
                    fh = a;
                    head_sclass = b;
                }
            }
            record.sclass_id = calculated_sclass;
        }
        record.file_head = fh;
        records.push(record);
    }

    Ok(LoadedSnapshot {
        next_chunk_id,
        records,
        file_count,
    })
}
