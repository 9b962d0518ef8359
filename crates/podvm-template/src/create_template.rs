//! Create a vSphere VM template from a disk image.
//!
//! The image is converted to a stream-optimized VMDK, described with a
//! generated OVF, and imported through an `HttpNfcLease` into the chosen
//! datacenter, cluster and datastore.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{debug, info};

use crate::cancel::{self, Cancellation};
use crate::convert::{self, ImageConverter, PreparedDisk, QemuImg};
use crate::import_spec;
use crate::inventory::{Placement, PlacementRequest};
use crate::lease::{LeaseConfig, LeaseCoordinator};
use crate::ovf::OvfBuilder;
use crate::plane::MoRef;
use crate::session::{with_session, ConnectionConfig, Session};
use crate::upload::{HttpUploader, Uploader};
use crate::utils;

/// Connection to the vCenter / ESXi endpoint
#[derive(Debug, Args, Clone)]
#[clap(next_help_heading = "Connection")]
pub struct ConnectionOpts {
    /// vSphere service address to connect to
    #[clap(short = 's', long)]
    pub host: String,

    /// Port to connect on
    #[clap(short = 'o', long, default_value_t = ConnectionConfig::DEFAULT_PORT)]
    pub port: u16,

    /// User name to use when connecting to host
    #[clap(short = 'u', long)]
    pub user: String,

    /// Password to use when connecting to host (prompted for when absent)
    #[clap(short = 'p', long)]
    pub password: Option<String>,

    /// Disable SSL host certificate verification
    #[clap(long = "disable-ssl-verification", visible_alias = "nossl")]
    pub disable_ssl_verification: bool,
}

impl ConnectionOpts {
    fn config(&self, password: String, lease_call_timeout: Duration) -> ConnectionConfig {
        ConnectionConfig {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password,
            verify_ssl: !self.disable_ssl_verification,
            timeout: ConnectionConfig::DEFAULT_TIMEOUT,
            lease_call_timeout,
        }
    }

    fn password(&self) -> Result<String> {
        if let Some(p) = &self.password {
            return Ok(p.clone());
        }
        dialoguer::Password::new()
            .with_prompt(format!(
                "Password for host {} and user {}",
                self.host, self.user
            ))
            .interact()
            .wrap_err("Reading password")
    }
}

/// Where to create the template; each defaults to the first one found
#[derive(Debug, Args, Clone, Default)]
#[clap(next_help_heading = "Placement")]
pub struct PlacementOpts {
    /// Datacenter name
    #[clap(long)]
    pub datacenter_name: Option<String>,

    /// Cluster name
    #[clap(long)]
    pub cluster_name: Option<String>,

    /// Datastore name
    #[clap(long)]
    pub datastore_name: Option<String>,
}

impl From<PlacementOpts> for PlacementRequest {
    fn from(o: PlacementOpts) -> Self {
        PlacementRequest {
            datacenter: o.datacenter_name,
            cluster: o.cluster_name,
            datastore: o.datastore_name,
        }
    }
}

/// Import timing
#[derive(Debug, Args, Clone)]
#[clap(next_help_heading = "Lease")]
pub struct LeaseOpts {
    /// Pause before importing, giving a chance to cancel (e.g. "5s")
    #[clap(long, value_parser = utils::parse_duration, default_value = "5s")]
    pub start_delay: Duration,

    /// Delay between lease readiness polls
    #[clap(long, value_parser = utils::parse_duration, default_value = "1s")]
    pub lease_poll_interval: Duration,

    /// Give up if the lease is not ready after this long (default: wait forever)
    #[clap(long, value_parser = utils::parse_duration)]
    pub lease_timeout: Option<Duration>,

    /// Period of lease keepalive pings during upload
    #[clap(long, value_parser = utils::parse_duration, default_value = "5s")]
    pub keepalive_interval: Duration,
}

impl LeaseOpts {
    /// Timeout for keepalive pings and lease state reads: a few keepalive
    /// periods, but never less than the default.
    fn call_timeout(&self) -> Duration {
        self.keepalive_interval
            .saturating_mul(4)
            .max(ConnectionConfig::DEFAULT_LEASE_CALL_TIMEOUT)
    }
}

impl From<&LeaseOpts> for LeaseConfig {
    fn from(o: &LeaseOpts) -> Self {
        LeaseConfig {
            poll_interval: o.lease_poll_interval,
            ready_timeout: o.lease_timeout,
            keepalive_interval: o.keepalive_interval,
        }
    }
}

/// Options for creating a template
#[derive(Debug, Parser, Clone)]
pub struct CreateTemplateOpts {
    /// Disk image to convert and upload (path or URL understood by qemu-img)
    #[clap(short = 'i', long)]
    pub image: String,

    /// Name of the template/VM
    #[clap(long, default_value = "podvm-base")]
    pub template: String,

    /// Memory for the template (e.g. "2G", "4096M")
    #[clap(long, value_parser = utils::parse_memory_to_mb, default_value = "2G")]
    pub memory: u64,

    /// Number of vCPUs for the template
    #[clap(long, default_value_t = 2)]
    pub vcpus: u32,

    /// VMware guest OS identifier written to the descriptor
    #[clap(long, default_value = "otherLinux64Guest")]
    pub guest_id: String,

    /// Virtual hardware version written to the descriptor
    #[clap(long, default_value = "vmx-13")]
    pub hardware_version: String,

    /// Directory for the converted disk and descriptor (default: a temporary directory)
    #[clap(long)]
    pub workdir: Option<Utf8PathBuf>,

    /// qemu-img binary to use
    #[clap(long, default_value = "qemu-img")]
    pub qemu_img: String,

    /// Suppress the progress bar and summary banner
    #[clap(long, short = 'q')]
    pub quiet: bool,

    #[clap(flatten)]
    pub connection: ConnectionOpts,

    #[clap(flatten)]
    pub placement: PlacementOpts,

    #[clap(flatten)]
    pub lease: LeaseOpts,
}

/// Everything the remote half of the workflow needs.
#[derive(Debug)]
pub struct ImportRequest<'a> {
    pub template: &'a str,
    pub descriptor: &'a str,
    pub disk: &'a Utf8Path,
    pub placement: PlacementRequest,
    pub start_delay: Duration,
    pub lease: LeaseConfig,
    pub quiet: bool,
}

/// What was created.
#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub datacenter: String,
    pub cluster: String,
    pub datastore: String,
    pub lease: MoRef,
}

/// Resolve placement, build the import spec and run the lease, logging out
/// of `session` afterwards whatever happens.
pub fn import_template(
    session: Session,
    req: &ImportRequest<'_>,
    uploader: &dyn Uploader,
    cancel: &Cancellation,
) -> Result<ImportSummary> {
    with_session(session, |s| {
        let plane = s.plane();
        let placement =
            Placement::resolve(plane.as_ref(), &req.placement).wrap_err("Resolving inventory")?;
        let spec = import_spec::build(
            plane.as_ref(),
            req.descriptor,
            &placement.resource_pool,
            &placement.datastore.moref,
            req.template,
        )
        .wrap_err("Creating import spec")?;

        if !req.quiet {
            println!(
                "Datacenter: {} Datastore: {} Cluster: {}",
                placement.datacenter.name, placement.datastore.name, placement.cluster.name
            );
            println!(
                "Creating template {} from {} on host {}",
                req.template,
                req.disk,
                plane.host()
            );
            if !req.start_delay.is_zero() {
                println!(
                    "Press Ctrl-C to cancel in {} seconds!",
                    req.start_delay.as_secs()
                );
            }
        }
        cancel.sleep(req.start_delay)?;

        let mut lease = LeaseCoordinator::request_import(
            Arc::clone(plane),
            &spec,
            &placement.resource_pool,
            &placement.vm_folder,
            req.lease.clone(),
            cancel.clone(),
        )
        .wrap_err("Importing template")?;
        lease.run(uploader, req.disk).wrap_err_with(|| {
            format!(
                "Uploading disk through lease {} (now {})",
                lease.lease(),
                lease.state()
            )
        })?;
        debug!("Lease {} went through {:?}", lease.lease(), lease.transitions());

        Ok(ImportSummary {
            datacenter: placement.datacenter.name,
            cluster: placement.cluster.name,
            datastore: placement.datastore.name,
            lease: lease.lease().clone(),
        })
    })
}

/// Convert `image` into `workdir`.
///
/// The converter runs in our process group, so an interrupt kills it too;
/// its failure is then reported as the cancellation it is.
fn convert_image(
    converter: &dyn ImageConverter,
    image: &str,
    workdir: &Utf8Path,
    cancel: &Cancellation,
) -> Result<PreparedDisk> {
    let disk = convert::prepare_disk(converter, image, workdir);
    cancel.check()?;
    disk.wrap_err_with(|| format!("Converting {image}"))
}

/// Execute the template creation
pub fn run(opts: CreateTemplateOpts) -> Result<()> {
    let cancel = Cancellation::new();
    cancel::install_interrupt_handler(cancel.clone()).wrap_err("Installing interrupt handler")?;

    let qemu_img = QemuImg::with_program(&opts.qemu_img);
    qemu_img.ensure_available()?;

    // Keep the temporary directory alive until the upload is done
    let (_tempdir, workdir) = match &opts.workdir {
        Some(dir) => {
            utils::ensure_workdir(dir)?;
            (None, dir.clone())
        }
        None => {
            let td = tempfile::Builder::new()
                .prefix("podvm-template")
                .tempdir()
                .wrap_err("Creating temporary directory")?;
            let path = Utf8PathBuf::try_from(td.path().to_path_buf())
                .map_err(|e| eyre!("Non-UTF-8 temporary directory: {e}"))?;
            (Some(td), path)
        }
    };

    let disk = convert_image(&qemu_img, &opts.image, &workdir, &cancel)?;

    let descriptor = OvfBuilder::new()
        .with_name(&opts.template)
        .with_disk_file(disk.file_name())
        .with_capacity(disk.info.virtual_size)
        .with_populated_size(disk.info.actual_size)
        .with_memory(opts.memory)
        .with_vcpus(opts.vcpus)
        .with_os_type(&opts.guest_id)
        .with_hardware_version(&opts.hardware_version)
        .build_xml()?;
    let ovf_path = workdir.join(format!("{}.ovf", opts.template));
    std::fs::write(&ovf_path, &descriptor).wrap_err_with(|| format!("Writing {ovf_path}"))?;
    debug!("Wrote descriptor {ovf_path}");

    let password = opts.connection.password()?;
    let config = opts.connection.config(password, opts.lease.call_timeout());
    let session = Session::connect(&config)
        .wrap_err_with(|| format!("Connecting to {}:{}", config.host, config.port))?;

    let uploader = HttpUploader::new(config.verify_ssl, !opts.quiet)?;
    let req = ImportRequest {
        template: &opts.template,
        descriptor: &descriptor,
        disk: &disk.path,
        placement: opts.placement.clone().into(),
        start_delay: opts.lease.start_delay,
        lease: LeaseConfig::from(&opts.lease),
        quiet: opts.quiet,
    };
    let summary = import_template(session, &req, &uploader, &cancel)?;

    info!(
        "Created template {} in {}/{} on {} via lease {}",
        opts.template, summary.datacenter, summary.cluster, summary.datastore, summary.lease
    );
    if !opts.quiet {
        println!("Template {} created", opts.template);
    }
    Ok(())
}
