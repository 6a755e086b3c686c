#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use nxfs_core::{open_path, FileContainer};
use nxfs_types::{Oid, Xid};
use serde::Serialize;
use std::env;
use std::path::Path;

#[derive(Debug, Serialize)]
struct InspectOutput {
    xid: u64,
    block_size: u32,
    block_count: u64,
    uuid: String,
    checkpoint_block: u64,
    ephemeral_mappings: usize,
    volumes: usize,
}

#[derive(Debug, Serialize)]
struct VolumeOutput {
    index: usize,
    name: String,
    files: u64,
    directories: u64,
    snapshots: u64,
    role: u16,
    role_names: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct ResolveOutput {
    oid: u64,
    xid: u64,
    paddr: i64,
    size: u32,
    flags: u32,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        "checkpoints" => {
            let Some(path) = args.next() else {
                bail!("checkpoints requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            checkpoints(Path::new(&path), json)
        }
        "volumes" => {
            let Some(path) = args.next() else {
                bail!("volumes requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            volumes(Path::new(&path), json)
        }
        "resolve" => {
            let Some(path) = args.next() else {
                bail!("resolve requires <image-path> <oid>");
            };
            let Some(oid) = args.next() else {
                bail!("resolve requires <image-path> <oid>");
            };
            let oid = parse_number(&oid).context("object id must be a number")?;
            let remaining: Vec<String> = args.collect();
            let json = remaining.iter().any(|arg| arg == "--json");
            let max_xid = flag_value(&remaining, "--xid")?
                .map(|raw| parse_number(&raw).context("--xid must be a number"))
                .transpose()?;
            let volume = flag_value(&remaining, "--volume")?
                .map(|raw| raw.parse::<usize>().context("--volume must be an index"))
                .transpose()?;
            resolve(Path::new(&path), Oid(oid), max_xid.map(Xid), volume, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("nxfs-cli\n");
    println!("USAGE:");
    println!("  nxfs-cli inspect <image-path> [--json]");
    println!("  nxfs-cli checkpoints <image-path> [--json]");
    println!("  nxfs-cli volumes <image-path> [--json]");
    println!("  nxfs-cli resolve <image-path> <oid> [--xid <xid>] [--volume <index>] [--json]");
}

fn format_uuid(bytes: &[u8; 16]) -> String {
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Names for the role bits set in a volume superblock.
fn role_names(role: u16) -> Vec<&'static str> {
    use nxfs_ondisk::{
        APFS_VOL_ROLE_DATA, APFS_VOL_ROLE_INSTALLER, APFS_VOL_ROLE_NONE, APFS_VOL_ROLE_PREBOOT,
        APFS_VOL_ROLE_RECOVERY, APFS_VOL_ROLE_SYSTEM, APFS_VOL_ROLE_USER, APFS_VOL_ROLE_VM,
    };

    if role == APFS_VOL_ROLE_NONE {
        return vec!["none"];
    }
    let known = [
        (APFS_VOL_ROLE_SYSTEM, "system"),
        (APFS_VOL_ROLE_USER, "user"),
        (APFS_VOL_ROLE_RECOVERY, "recovery"),
        (APFS_VOL_ROLE_VM, "vm"),
        (APFS_VOL_ROLE_PREBOOT, "preboot"),
        (APFS_VOL_ROLE_INSTALLER, "installer"),
        (APFS_VOL_ROLE_DATA, "data"),
    ];
    known
        .iter()
        .filter(|(bit, _)| role & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Accept decimal or 0x-prefixed hex.
fn parse_number(raw: &str) -> Result<u64> {
    if let Some(hex) = raw.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).map_err(Into::into)
    } else {
        raw.parse().map_err(Into::into)
    }
}

fn flag_value(args: &[String], flag: &str) -> Result<Option<String>> {
    let Some(at) = args.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    match args.get(at + 1) {
        Some(value) => Ok(Some(value.clone())),
        None => bail!("{flag} requires a value"),
    }
}

fn mount(path: &Path) -> Result<FileContainer> {
    open_path(path).with_context(|| format!("failed to mount container image: {}", path.display()))
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let container = mount(path)?;
    let sb = container.superblock();
    let output = InspectOutput {
        xid: container.xid().0,
        block_size: sb.block_size.get(),
        block_count: sb.block_count,
        uuid: format_uuid(&sb.uuid),
        checkpoint_block: container.checkpoint().block,
        ephemeral_mappings: container.checkpoint().mappings.len(),
        volumes: container.volume_indices().len(),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("NXFS Inspector");
        println!("xid: {}", output.xid);
        println!("block_size: {}", output.block_size);
        println!("block_count: {}", output.block_count);
        println!("uuid: {}", output.uuid);
        println!("checkpoint_block: {}", output.checkpoint_block);
        println!("ephemeral_mappings: {}", output.ephemeral_mappings);
        println!("volumes: {}", output.volumes);
    }

    Ok(())
}

fn checkpoints(path: &Path, json: bool) -> Result<()> {
    let container = mount(path)?;
    let slots = container
        .descriptor_ring()
        .context("enumerate descriptor ring")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&slots).context("serialize output")?
        );
    } else {
        for slot in &slots {
            println!(
                "slot {:>3}  block {:>8}  {}",
                slot.slot,
                slot.block,
                describe(&slot.contents)
            );
        }
    }

    Ok(())
}

fn describe(contents: &nxfs_core::RingSlotKind) -> String {
    use nxfs_core::RingSlotKind;
    match contents {
        RingSlotKind::Superblock { xid } => format!("superblock xid={xid}"),
        RingSlotKind::CheckpointMap { xid, entries, last } => {
            format!("checkpoint-map xid={xid} entries={entries} last={last}")
        }
        RingSlotKind::Other { object_kind } => format!("other kind={object_kind:#x}"),
        RingSlotKind::Invalid => "invalid".to_owned(),
    }
}

fn volumes(path: &Path, json: bool) -> Result<()> {
    let container = mount(path)?;
    let mut output = Vec::new();
    for index in container.volume_indices() {
        let Some(volume) = container
            .volume(index)
            .with_context(|| format!("load volume {index}"))?
        else {
            continue;
        };
        output.push(VolumeOutput {
            index,
            name: volume.name().to_owned(),
            files: volume.superblock.num_files,
            directories: volume.superblock.num_directories,
            snapshots: volume.superblock.num_snapshots,
            role: volume.superblock.role,
            role_names: role_names(volume.superblock.role),
        });
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        for volume in &output {
            println!(
                "volume {}: {:?} (files={}, directories={}, snapshots={}, role={})",
                volume.index,
                volume.name,
                volume.files,
                volume.directories,
                volume.snapshots,
                volume.role_names.join("+")
            );
        }
    }

    Ok(())
}

fn resolve(
    path: &Path,
    oid: Oid,
    max_xid: Option<Xid>,
    volume_index: Option<usize>,
    json: bool,
) -> Result<()> {
    let container = mount(path)?;

    let omap = match volume_index {
        Some(index) => {
            let volume = container
                .volume(index)
                .with_context(|| format!("load volume {index}"))?
                .with_context(|| format!("volume slot {index} is empty"))?;
            volume.object_map().context("open volume object map")?
        }
        None => container.object_map().context("open container object map")?,
    };

    let at = max_xid.unwrap_or_else(|| container.xid());
    let Some(entry) = omap
        .lookup_at(oid, at)
        .with_context(|| format!("resolve {oid} at xid {at}"))?
    else {
        bail!("{oid} is not mapped at xid {at}");
    };

    let output = ResolveOutput {
        oid: oid.0,
        xid: entry.xid.0,
        paddr: entry.paddr.0,
        size: entry.size,
        flags: entry.flags,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!(
            "{oid} -> paddr {} (written at xid {}, size {}, flags {:#x})",
            output.paddr, output.xid, output.size, output.flags
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nxfs_ondisk::{APFS_VOL_ROLE_DATA, APFS_VOL_ROLE_SYSTEM};

    #[test]
    fn role_names_decode_the_bitfield() {
        assert_eq!(role_names(0), vec!["none"]);
        assert_eq!(role_names(APFS_VOL_ROLE_SYSTEM), vec!["system"]);
        assert_eq!(role_names(APFS_VOL_ROLE_DATA), vec!["data"]);
        assert_eq!(
            role_names(APFS_VOL_ROLE_SYSTEM | APFS_VOL_ROLE_DATA),
            vec!["system", "data"]
        );
    }

    #[test]
    fn numbers_parse_in_both_bases() {
        assert_eq!(parse_number("42").expect("decimal"), 42);
        assert_eq!(parse_number("0x2a").expect("hex"), 42);
        assert!(parse_number("nope").is_err());
    }
}
