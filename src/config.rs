//! Compile-time TLS constants and the runtime tunables that size the static surplus.

use thiserror::Error;

/// Number of slotinfo (and initial DTV) entries kept beyond those needed at startup.
pub const TLS_SLOTINFO_SURPLUS: usize = 62;

/// Extra DTV slots allocated whenever a DTV has to grow.
pub const DTV_SURPLUS: usize = 14;

/// Alignment of the thread control block, and the minimum alignment of the static TLS block.
pub const TCB_ALIGNMENT: usize = 64;

/// Upper bound on the number of link namespaces.
pub const DL_NNS: usize = 16;

pub const DEFAULT_NNS: usize = 4;

/// Static TLS reserved for the runtime itself in every namespace but the first.
pub const LIBC_IE_TLS: usize = 144;

/// Static TLS reserved per namespace for other initial-exec users.
pub const OTHER_IE_TLS: usize = 144;

pub const DEFAULT_OPTIONAL_STATIC_TLS: usize = 512;

/// Environment variable carrying `name=value` tunables separated by `:`.
pub const TUNABLES_ENV: &str = "TLSBOOT_TUNABLES";

/// A rejected tunables string. Borrows from the environment block, it is produced before any
/// heap exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError<'a> {
    #[error("tunables are not valid UTF-8")]
    NotUtf8,
    #[error("unknown tunable `{0}`")]
    UnknownTunable(&'a str),
    #[error("tunable `{0}` is missing a value")]
    MissingValue(&'a str),
    #[error("invalid value `{value}` for tunable `{name}`")]
    InvalidValue { name: &'static str, value: &'a str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsConfig {
    /// Link namespaces to reserve static TLS for, in `1..=DL_NNS`.
    pub nns: usize,
    /// Bytes of static TLS that late-loaded modules may claim opportunistically.
    pub optional_static_tls: usize,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsConfig {
    pub const fn new() -> Self {
        Self {
            nns: DEFAULT_NNS,
            optional_static_tls: DEFAULT_OPTIONAL_STATIC_TLS,
        }
    }

    /// Parse a tunables string such as `rtld.nns=2:rtld.optional_static_tls=0x400`.
    ///
    /// Unset tunables keep their defaults. `nns` is clamped to `1..=DL_NNS`.
    pub fn parse(tunables: &str) -> Result<Self, ConfigError<'_>> {
        let mut config = Self::new();
        for item in tunables.split(':').filter(|item| !item.is_empty()) {
            let (name, value) = item
                .split_once('=')
                .ok_or(ConfigError::MissingValue(item))?;
            match name.trim_start_matches("glibc.") {
                "rtld.nns" => {
                    config.nns = parse_size("rtld.nns", value)?.clamp(1, DL_NNS);
                }
                "rtld.optional_static_tls" => {
                    config.optional_static_tls = parse_size("rtld.optional_static_tls", value)?;
                }
                _ => return Err(ConfigError::UnknownTunable(name)),
            }
        }
        Ok(config)
    }

    /// Read the tunables from an environment block of `NAME=value` entries. Defaults when the
    /// variable is unset.
    pub fn try_from_env<'a, I>(envp: I) -> Result<Self, ConfigError<'a>>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let Some(raw) = env_value(envp, TUNABLES_ENV) else {
            return Ok(Self::new());
        };
        let tunables = core::str::from_utf8(raw).map_err(|_| ConfigError::NotUtf8)?;
        Self::parse(tunables)
    }

    /// Like [`TlsConfig::try_from_env`], but a malformed tunables string is reported on the raw
    /// diagnostic sink and the defaults are used.
    ///
    /// Runs before TLS and the logger exist.
    pub fn from_env<'a, I>(envp: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        match Self::try_from_env(envp) {
            Ok(config) => config,
            Err(err) => {
                generic_rt::write_notls(format_args!("tlsboot: ignoring {}: {}", TUNABLES_ENV, err));
                Self::new()
            }
        }
    }

    /// Bytes reserved after the startup modules in every static TLS block.
    pub fn static_surplus(&self) -> usize {
        let nns = self.nns.clamp(1, DL_NNS);
        (nns - 1) * LIBC_IE_TLS + nns * OTHER_IE_TLS + self.optional_static_tls
    }
}

fn parse_size<'a>(name: &'static str, value: &'a str) -> Result<usize, ConfigError<'a>> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| ConfigError::InvalidValue { name, value })
}

/// Find `name` in an environment block and return the bytes after `=`.
pub fn env_value<'a, I>(envp: I, name: &str) -> Option<&'a [u8]>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    envp.into_iter().find_map(|entry| {
        entry
            .strip_prefix(name.as_bytes())
            .and_then(|rest| rest.strip_prefix(b"="))
    })
}
