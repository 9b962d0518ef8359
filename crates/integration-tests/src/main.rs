use std::path::Path;
use std::process::Command;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use xshell::{cmd, Shell};

mod tests {
    pub mod create_template;
}

/// Get the path to the podvm-template binary, checking PODVM_TEMPLATE_PATH env var first,
/// then falling back to "podvm-template"
pub(crate) fn get_podvm_template_command() -> Result<String> {
    if let Ok(path) = std::env::var("PODVM_TEMPLATE_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/podvm-template", "target/release/podvm-template"]
        .into_iter()
        .find(|p| Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set PODVM_TEMPLATE_PATH={path} to run using this binary"
        ));
    }
    Ok("podvm-template".to_owned())
}

/// Whether qemu-img can be run; some tests need it to produce real images
pub(crate) fn qemu_img_available() -> bool {
    Command::new("qemu-img")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn test_version() -> Result<()> {
    println!("Running test: podvm-template --version");

    let sh = Shell::new()?;
    let bin = get_podvm_template_command()?;

    let output = cmd!(sh, "{bin} --version").output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!("Failed to run 'podvm-template --version': {}", stderr));
    }

    let stdout = String::from_utf8(output.stdout).context("Non-UTF-8 version output")?;
    if !stdout.starts_with("podvm-template ") {
        return Err(eyre!("Unexpected version output: {}", stdout));
    }

    println!("Test passed: podvm-template --version ({})", stdout.trim());
    Ok(())
}

fn main() {
    let args = Arguments::from_args();

    let tests = vec![
        Trial::test("version", || {
            test_version()?;
            Ok(())
        }),
        Trial::test("create_template_help", || {
            tests::create_template::test_create_template_help();
            Ok(())
        }),
        Trial::test("create_template_missing_args", || {
            tests::create_template::test_create_template_missing_args();
            Ok(())
        }),
        Trial::test("create_template_missing_converter", || {
            tests::create_template::test_create_template_missing_converter();
            Ok(())
        }),
        Trial::test("create_template_bad_image", || {
            tests::create_template::test_create_template_bad_image();
            Ok(())
        }),
        Trial::test("create_template_unreachable_host", || {
            tests::create_template::test_create_template_unreachable_host();
            Ok(())
        }),
    ];

    libtest_mimic::run(&args, tests).exit();
}
