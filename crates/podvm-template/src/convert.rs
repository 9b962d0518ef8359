//! Disk image conversion with qemu-img

use std::process::Command;

use bootc_utils::CommandRunExt;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{ImportError, ImportResult};

/// Size metadata of a disk image, from `qemu-img info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiskInfo {
    /// Guest-visible size in bytes
    pub virtual_size: u64,
    /// Bytes used on the host
    pub actual_size: u64,
}

/// Converts source images into stream-optimized VMDKs.
pub trait ImageConverter {
    /// Convert `source` (a path or URL qemu-img understands) into `dest`.
    fn convert(&self, source: &str, dest: &Utf8Path) -> ImportResult<()>;

    /// Read size metadata of a local image.
    fn info(&self, disk: &Utf8Path) -> ImportResult<DiskInfo>;
}

/// The `qemu-img` tool.
#[derive(Debug, Clone)]
pub struct QemuImg {
    program: String,
}

impl Default for QemuImg {
    fn default() -> Self {
        Self {
            program: "qemu-img".to_string(),
        }
    }
}

impl QemuImg {
    /// Use a specific qemu-img binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    /// Fail early if the binary cannot be run at all.
    pub fn ensure_available(&self) -> ImportResult<()> {
        match self.command().arg("--version").output() {
            Ok(o) if o.status.success() => Ok(()),
            Ok(o) => Err(ImportError::Conversion(format!(
                "{} --version failed: {}",
                self.program,
                String::from_utf8_lossy(&o.stderr).trim()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ImportError::Conversion(
                format!("{} not found; please install it and try again", self.program),
            )),
            Err(e) => Err(ImportError::Conversion(format!("{}: {e}", self.program))),
        }
    }
}

impl ImageConverter for QemuImg {
    fn convert(&self, source: &str, dest: &Utf8Path) -> ImportResult<()> {
        debug!("{} convert {source} -> {dest}", self.program);
        self.command()
            .args(["convert", "-O", "vmdk", "-o", "subformat=streamOptimized", source])
            .arg(dest)
            .run()
            .map_err(|e| ImportError::Conversion(format!("converting {source}: {e:#}")))
    }

    fn info(&self, disk: &Utf8Path) -> ImportResult<DiskInfo> {
        self.command()
            .args(["info", "--output", "json"])
            .arg(disk)
            .run_and_parse_json()
            .map_err(|e| ImportError::Conversion(format!("inspecting {disk}: {e:#}")))
    }
}

/// A converted disk ready for upload.
#[derive(Debug, Clone)]
pub struct PreparedDisk {
    pub path: Utf8PathBuf,
    pub info: DiskInfo,
}

impl PreparedDisk {
    /// File name of the VMDK, as referenced from the descriptor.
    pub fn file_name(&self) -> &str {
        self.path.file_name().unwrap_or(self.path.as_str())
    }
}

/// Base name for the converted disk: the source's file stem.
pub fn disk_stem(source: &str) -> &str {
    let last = source.rsplit('/').next().unwrap_or(source);
    let last = last.split(['?', '#']).next().unwrap_or(last);
    match Utf8Path::new(last).file_stem() {
        Some(s) if !s.is_empty() => s,
        _ => "disk",
    }
}

/// Convert `source` into `{workdir}/{stem}.vmdk` and read its sizes.
pub fn prepare_disk(
    converter: &dyn ImageConverter,
    source: &str,
    workdir: &Utf8Path,
) -> ImportResult<PreparedDisk> {
    let path = workdir.join(format!("{}.vmdk", disk_stem(source)));
    info!("Converting {source} to {path}");
    converter.convert(source, &path)?;
    if !path.exists() {
        return Err(ImportError::Conversion(format!(
            "converter produced no output at {path}"
        )));
    }
    let info = converter.info(&path)?;
    debug!(
        "Disk virtual size {} bytes, actual size {} bytes",
        info.virtual_size, info.actual_size
    );
    Ok(PreparedDisk { path, info })
}
