use clap::Parser;

mod cancel;
mod convert;
mod create_template;
mod error;
mod import_spec;
mod inventory;
mod lease;
mod ovf;
mod plane;
mod session;
#[cfg(test)]
mod testutil;
mod upload;
mod utils;
mod vim;

/// Create a vSphere VM template from a disk image.
///
/// The image is converted to a stream-optimized VMDK with qemu-img,
/// described with a generated OVF, and uploaded to vCenter through an
/// import lease that is kept alive for the duration of the transfer.
#[derive(Parser)]
#[command(name = "podvm-template", version)]
struct Cli {
    #[clap(flatten)]
    opts: create_template::CreateTemplateOpts,
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by RUST_LOG environment variable, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Exits 0 on success, 130 when interrupted and 1 on any other failure.
fn main() {
    install_tracing();
    if let Err(e) = color_eyre::install() {
        eprintln!("Failed to install error handler: {e}");
    }

    // Usage errors share the generic failure status
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(error::EXIT_FAILURE);
        }
        Err(e) => e.exit(),
    };

    if let Err(e) = create_template::run(cli.opts) {
        let code = error::exit_code_for(&e);
        if code == error::EXIT_INTERRUPTED {
            eprintln!("Import cancelled, logged off");
        } else {
            eprintln!("Error: {e:?}");
        }
        std::process::exit(code);
    }
}
