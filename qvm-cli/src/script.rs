//! Launch script commands: new, show, add, set, enable, disable.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use qvm::{ScriptBuilder, Settings};

use crate::{DriverArgs, OutputFormat};

/// Subcommands for `qvm script`.
#[derive(Subcommand)]
pub enum ScriptAction {
    /// Write a launch script for a new VM.
    New(NewArgs),

    /// Print the flags of a launch script.
    Show {
        /// Launch script path.
        script: PathBuf,

        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Append a value to a flag.
    Add(ValueArgs),

    /// Replace all values of a flag with one value.
    Set(ValueArgs),

    /// Turn a flag into a boolean flag.
    Enable(FlagArgs),

    /// Remove a flag.
    #[command(visible_alias = "rm")]
    Disable(FlagArgs),
}

/// Arguments for `qvm script new`.
#[derive(clap::Args)]
pub struct NewArgs {
    /// VM name; the script is written to `<out>/<name>.sh`.
    #[arg(long)]
    pub name: String,

    /// Disk image base name (default: the VM name).
    #[arg(long)]
    pub disk: Option<String>,

    /// Guest memory in MiB.
    #[arg(long, default_value_t = 512)]
    pub memory: u32,

    /// Installation ISO attached as CD-ROM.
    #[arg(long)]
    pub iso: Option<String>,

    /// Host port forwarded to the guest's SSH port.
    #[arg(long, default_value_t = 2222)]
    pub ssh_port: u16,

    /// VNC display number.
    #[arg(long)]
    pub vnc: Option<u16>,

    /// Extra flag as `flag=value`; repeatable.
    #[arg(long = "set", value_name = "FLAG=VALUE", value_parser = parse_flag_value)]
    pub extra: Vec<(String, String)>,

    /// Directory to write the script into.
    #[arg(long, default_value = ".")]
    pub out: PathBuf,
}

/// A script path plus a flag and its value.
#[derive(clap::Args)]
pub struct ValueArgs {
    /// Launch script path.
    pub script: PathBuf,
    /// Flag name, with or without the leading `-`.
    pub flag: String,
    /// Flag value.
    pub value: String,
}

/// A script path plus a flag.
#[derive(clap::Args)]
pub struct FlagArgs {
    /// Launch script path.
    pub script: PathBuf,
    /// Flag name, with or without the leading `-`.
    pub flag: String,
}

impl ScriptAction {
    pub fn run(self, driver: &DriverArgs) -> Result<()> {
        match self {
            Self::New(args) => new(args, &driver.kvm),
            Self::Show { script, format } => show(&script, format),
            Self::Add(args) => edit(&args.script, &driver.kvm, |s| {
                s.add(flag_name(&args.flag), args.value.as_str());
            }),
            Self::Set(args) => edit(&args.script, &driver.kvm, |s| {
                s.set(flag_name(&args.flag), args.value.as_str());
            }),
            Self::Enable(args) => edit(&args.script, &driver.kvm, |s| {
                s.enable(flag_name(&args.flag));
            }),
            Self::Disable(args) => edit(&args.script, &driver.kvm, |s| {
                s.disable(flag_name(&args.flag));
            }),
        }
    }
}

fn new(args: NewArgs, program: &str) -> Result<()> {
    let mut builder = ScriptBuilder::new(&args.name)
        .memory_mib(args.memory)
        .host_ssh_port(args.ssh_port);
    if let Some(disk) = args.disk {
        builder = builder.disk_name(disk);
    }
    if let Some(iso) = args.iso {
        builder = builder.iso_path(iso);
    }
    if let Some(display) = args.vnc {
        builder = builder.vnc_display(display);
    }
    for (flag, value) in args.extra {
        builder = builder.extra(flag, value);
    }

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("creating {}", args.out.display()))?;
    let path = args.out.join(format!("{}.sh", args.name));
    builder
        .build()
        .write_script_for(&path, program)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("{}", path.display());
    Ok(())
}

fn show(script: &Path, format: OutputFormat) -> Result<()> {
    let settings = read(script)?;

    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    if settings.is_empty() {
        println!("No flags.");
        return Ok(());
    }
    println!("{:<16} VALUE", "FLAG");
    for (name, values) in settings.iter() {
        if values.is_empty() {
            println!("{:<16} (enabled)", format!("-{name}"));
        }
        for value in values {
            println!("{:<16} {value}", format!("-{name}"));
        }
    }
    Ok(())
}

/// Reads `script`, applies `change`, and writes it back.
fn edit(script: &Path, program: &str, change: impl FnOnce(&mut Settings)) -> Result<()> {
    let mut settings = read(script)?;
    change(&mut settings);
    settings
        .write_script_for(script, program)
        .with_context(|| format!("writing {}", script.display()))?;
    tracing::debug!(script = %script.display(), flags = settings.len(), "launch script updated");
    Ok(())
}

fn read(script: &Path) -> Result<Settings> {
    Settings::read_script(script).with_context(|| format!("reading {}", script.display()))
}

/// Accepts `-m` as well as `m`.
fn flag_name(flag: &str) -> &str {
    flag.trim_start_matches('-')
}

/// Parses a `--set flag=value` argument.
fn parse_flag_value(arg: &str) -> Result<(String, String), String> {
    let (flag, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected FLAG=VALUE, got '{arg}'"))?;
    let flag = flag_name(flag);
    if flag.is_empty() {
        return Err(format!("missing flag name in '{arg}'"));
    }
    Ok((flag.to_owned(), value.to_owned()))
}
