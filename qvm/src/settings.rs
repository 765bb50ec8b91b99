//! Launch-script settings: parsing, mutation, and encoding.
//!
//! A launch script is a small POSIX shell file that `cd`s into its own
//! directory and `exec`s the hypervisor with one flag per continuation line:
//!
//! ```text
//! #!/bin/sh
//!
//! cd "$(dirname "$0")"
//!
//! exec kvm \
//!   -S \
//!   -drive "file=disk.img,if=virtio" \
//!   -m "512" \
//!
//! ```
//!
//! [`Settings`] keeps flags sorted by name so that [`Settings::encode`] is
//! deterministic. Values of a repeated flag keep their order.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{BufRead, Write as _};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{fs, io};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Program named in the `exec` line by [`Settings::encode`].
pub const DEFAULT_PROGRAM: &str = "kvm";

/// File name of the QMP socket, relative to the launch script's directory.
pub const CONTROL_SOCKET: &str = "control";

/// Returns the control socket path for the launch script at `script`.
///
/// Scripts `cd` into their own directory before starting the VM, so the
/// `-qmp unix:control,...` socket lands next to the script.
pub fn control_socket_path(script: impl AsRef<Path>) -> PathBuf {
    script
        .as_ref()
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(CONTROL_SOCKET)
}

/// Parsed launch-script flags.
///
/// A flag with no values is a boolean flag (`-daemonize`); a flag with one
/// or more values is emitted once per value (`-drive "..."` repeated).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    /// Flag name (without the leading `-`) to its values, sorted by name.
    flags: BTreeMap<String, Vec<String>>,
}

impl Settings {
    /// Creates an empty set of flags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a launch script.
    ///
    /// Lines that do not start with `-` are ignored, whatever bytes they
    /// hold. Flag lines without a name or that are not UTF-8 are skipped and
    /// values with unbalanced quotes are accepted; all are reported through
    /// `tracing`.
    pub fn parse(reader: impl BufRead) -> Result<Self> {
        Self::parse_with(reader, false)
    }

    /// Like [`parse`](Self::parse), but malformed flag lines are errors.
    pub fn parse_strict(reader: impl BufRead) -> Result<Self> {
        Self::parse_with(reader, true)
    }

    /// Parses a launch script held in memory.
    pub fn parse_str(text: &str) -> Result<Self> {
        Self::parse(text.as_bytes())
    }

    /// Reads and parses the launch script at `path`.
    pub fn read_script(path: impl AsRef<Path>) -> Result<Self> {
        let file = fs::File::open(path).map_err(Error::Parse)?;
        Self::parse(io::BufReader::new(file))
    }

    /// Shared parser; `strict` turns malformed flag lines into errors.
    fn parse_with(reader: impl BufRead, strict: bool) -> Result<Self> {
        let mut settings = Self::new();

        for (idx, raw) in reader.split(b'\n').enumerate() {
            let raw = raw.map_err(Error::Parse)?;
            let lineno = idx + 1;

            let Ok(line) = std::str::from_utf8(&raw) else {
                // Shell lines may carry any bytes; only flag lines must decode.
                if raw.trim_ascii_start().first() != Some(&b'-') {
                    continue;
                }
                if strict {
                    return Err(Error::Malformed {
                        line: lineno,
                        reason: "flag line is not valid UTF-8".to_owned(),
                    });
                }
                tracing::warn!(line = lineno, "skipping flag line that is not valid UTF-8");
                continue;
            };

            match classify(line) {
                Line::Skip => {}
                Line::Flag(name) => settings.enable(name),
                Line::Value {
                    name,
                    value,
                    balanced,
                } => {
                    if !balanced {
                        let reason = format!("unbalanced quotes in value of -{name}");
                        if strict {
                            return Err(Error::Malformed {
                                line: lineno,
                                reason,
                            });
                        }
                        tracing::warn!(line = lineno, "{reason}");
                    }
                    settings.add(name, value);
                }
                Line::Unnamed => {
                    if strict {
                        return Err(Error::Malformed {
                            line: lineno,
                            reason: "flag without a name".to_owned(),
                        });
                    }
                    tracing::warn!(line = lineno, text = %line.trim(), "skipping flag without a name");
                }
            }
        }

        Ok(settings)
    }

    /// Encodes the flags as a launch script that execs [`DEFAULT_PROGRAM`].
    pub fn encode(&self) -> String {
        self.encode_for(DEFAULT_PROGRAM)
    }

    /// Encodes the flags as a launch script that execs `program`.
    ///
    /// Values are quoted verbatim; a value containing `"` will not survive
    /// a round trip.
    pub fn encode_for(&self, program: &str) -> String {
        let mut out = String::from("#!/bin/sh\n\ncd \"$(dirname \"$0\")\"\n\n");
        let _ = writeln!(out, "exec {program} \\");

        for (name, values) in &self.flags {
            if values.is_empty() {
                let _ = writeln!(out, "  -{name} \\");
            }
            for value in values {
                let _ = writeln!(out, "  -{name} \"{value}\" \\");
            }
        }

        out.push('\n');
        out
    }

    /// Writes the encoded script to `path`, replacing any existing file.
    ///
    /// New files are created executable (`0755`) on Unix.
    pub fn write_script(&self, path: impl AsRef<Path>) -> Result<()> {
        self.write_script_for(path, DEFAULT_PROGRAM)
    }

    /// Like [`write_script`](Self::write_script), for a script that execs
    /// `program`.
    pub fn write_script_for(&self, path: impl AsRef<Path>, program: &str) -> Result<()> {
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o755);
        }

        let mut file = opts.open(path)?;
        file.write_all(self.encode_for(program).as_bytes())?;
        Ok(())
    }

    /// Appends a value to `name`. A boolean flag becomes a valued one.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.flags.entry(name.into()).or_default().push(value.into());
    }

    /// Replaces all values of `name` with exactly `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.flags.insert(name.into(), vec![value.into()]);
    }

    /// Makes `name` a boolean flag, discarding any values.
    pub fn enable(&mut self, name: impl Into<String>) {
        self.flags.insert(name.into(), Vec::new());
    }

    /// Removes `name`. Same as [`remove`](Self::remove): the script format
    /// has no way to express a disabled flag other than leaving it out.
    pub fn disable(&mut self, name: &str) {
        self.remove(name);
    }

    /// Removes `name` and all of its values.
    pub fn remove(&mut self, name: &str) {
        self.flags.remove(name);
    }

    /// Values of `name`; empty if absent or boolean.
    pub fn get(&self, name: &str) -> &[String] {
        self.get_ok(name).unwrap_or_default()
    }

    /// Values of `name`, or `None` if the flag is absent.
    pub fn get_ok(&self, name: &str) -> Option<&[String]> {
        self.flags.get(name).map(Vec::as_slice)
    }

    /// First value of `name`, or `""` if absent or boolean.
    pub fn get_single(&self, name: &str) -> &str {
        self.get_single_ok(name).unwrap_or_default()
    }

    /// First value of `name` (`""` for a boolean flag), or `None` if absent.
    pub fn get_single_ok(&self, name: &str) -> Option<&str> {
        self.get_ok(name)
            .map(|values| values.first().map_or("", String::as_str))
    }

    /// Returns `true` if `name` is present, boolean or valued.
    pub fn contains(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    /// Number of distinct flags.
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// Returns `true` if no flags are set.
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Iterates over flags in encoding order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.flags.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl FromStr for Settings {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_str(s)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut settings = Self::new();
        for (name, value) in iter {
            settings.add(name, value);
        }
        settings
    }
}

/// Classification of one launch-script line.
enum Line<'a> {
    /// Not a flag line.
    Skip,
    /// `-name` with nothing after it.
    Flag(&'a str),
    /// `-name value`, with surrounding quotes already stripped.
    Value {
        /// Flag name.
        name: &'a str,
        /// Unquoted value.
        value: &'a str,
        /// Whether opening and closing quotes matched.
        balanced: bool,
    },
    /// `-` followed by whitespace or nothing.
    Unnamed,
}

/// Classifies a raw line after stripping the continuation marker.
fn classify(raw: &str) -> Line<'_> {
    let line = raw.trim_end();
    let line = line.strip_suffix('\\').unwrap_or(line).trim();
    let Some(flag) = line.strip_prefix('-') else {
        return Line::Skip;
    };

    match flag.split_once(char::is_whitespace) {
        None if flag.is_empty() => Line::Unnamed,
        None => Line::Flag(flag),
        Some(("", _)) => Line::Unnamed,
        Some((name, rest)) => {
            let rest = rest.trim_start();
            let balanced = rest.starts_with('"') == (rest.len() > 1 && rest.ends_with('"'));
            Line::Value {
                name,
                value: rest.trim_matches('"'),
                balanced,
            }
        }
    }
}

/// Builds the default launch script for a new VM.
///
/// The VM starts paused (`-S`) and daemonized, with its QMP socket at
/// [`CONTROL_SOCKET`] so a control channel can attach before it runs.
///
/// # Example
///
/// ```
/// use qvm::ScriptBuilder;
///
/// let settings = ScriptBuilder::new("web")
///     .memory_mib(1024)
///     .iso_path("/isos/debian.iso")
///     .build();
/// assert_eq!(settings.get_single("m"), "1024");
/// assert_eq!(settings.get_single("drive"), "file=web.img,if=virtio");
/// ```
#[derive(Debug, Clone)]
#[must_use = "a ScriptBuilder does nothing until .build() is called"]
pub struct ScriptBuilder {
    /// VM name (`-name`).
    name: String,
    /// Disk image base name; defaults to the VM name.
    disk_name: Option<String>,
    /// Guest memory in MiB (`-m`).
    memory_mib: u32,
    /// Installation ISO (`-cdrom`).
    iso_path: Option<String>,
    /// Host port forwarded to guest port 22.
    host_ssh_port: u16,
    /// VNC display number.
    vnc_display: Option<u16>,
    /// Whether to add `-S`.
    start_paused: bool,
    /// Extra flags appended after the template.
    extra: Vec<(String, String)>,
}

impl ScriptBuilder {
    /// Starts a script for a VM called `name`.
    ///
    /// Defaults: 512 MiB RAM, SSH forwarded from host port 2222, paused
    /// start, no ISO, no VNC.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            disk_name: None,
            memory_mib: 512,
            iso_path: None,
            host_ssh_port: 2222,
            vnc_display: None,
            start_paused: true,
            extra: Vec::new(),
        }
    }

    /// Sets the disk image base name (`<disk>.img`).
    pub fn disk_name(mut self, disk: impl Into<String>) -> Self {
        self.disk_name = Some(disk.into());
        self
    }

    /// Sets guest memory in MiB.
    pub const fn memory_mib(mut self, mib: u32) -> Self {
        self.memory_mib = mib;
        self
    }

    /// Attaches an installation ISO as CD-ROM.
    pub fn iso_path(mut self, path: impl Into<String>) -> Self {
        self.iso_path = Some(path.into());
        self
    }

    /// Sets the host port forwarded to the guest's SSH port.
    pub const fn host_ssh_port(mut self, port: u16) -> Self {
        self.host_ssh_port = port;
        self
    }

    /// Enables a VNC server on display `display` (TCP port 5900 + display).
    pub const fn vnc_display(mut self, display: u16) -> Self {
        self.vnc_display = Some(display);
        self
    }

    /// Controls whether the VM waits for `cont` before running.
    pub const fn start_paused(mut self, paused: bool) -> Self {
        self.start_paused = paused;
        self
    }

    /// Appends a custom flag value after the template flags.
    pub fn extra(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((name.into(), value.into()));
        self
    }

    /// Produces the launch-script settings.
    pub fn build(&self) -> Settings {
        let mut s = Settings::new();

        if self.start_paused {
            s.enable("S");
        }
        s.set("name", &self.name);
        s.add("net", "nic,model=virtio");
        s.add("net", format!("user,hostfwd=tcp::{}-:22", self.host_ssh_port));
        s.enable("daemonize");
        s.set("monitor", "unix:monitor,server,nowait");
        s.set("qmp", format!("unix:{CONTROL_SOCKET},server,nowait"));

        let disk = self.disk_name.as_deref().unwrap_or(&self.name);
        s.set("drive", format!("file={disk}.img,if=virtio"));
        if let Some(ref iso) = self.iso_path {
            s.set("cdrom", iso);
        }
        s.set("m", self.memory_mib.to_string());

        if let Some(display) = self.vnc_display {
            s.set("vnc", format!(":{display},share=ignore"));
            s.add("usbdevice", "tablet");
        }

        for (name, value) in &self.extra {
            tracing::debug!(flag = %name, %value, "adding custom launch flag");
            s.add(name, value);
        }

        s
    }
}
