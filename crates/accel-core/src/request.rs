//! Request grammar for per-container accelerator requests
//!
//! The `--accel` argument format is `[<name>=]<runtime>[@<driver>[,<opt>…]]`
//! where `<name>` matches `[\w][\w.-]*` and `<runtime>` matches `[\w:.-]+`.
//! A bare `<name>=<slot-name>` binds to an existing global slot.
//!
//! Images request accelerators through the `runtime` label, a
//! semicolon-separated list of `name=runtime` or bare `runtime` entries.
//! Anonymous entries receive generated `anon_img_accel_<N>` names. Label
//! entries carry no driver or options.

use crate::error::{Error, Result};
use crate::types::AcceleratorConfig;
use regex::Regex;
use std::sync::OnceLock;

const NAME_EXP: &str = r"[\w][\w.-]*";
const RT_EXP: &str = r"[\w:.-]+";

/// Prefix for generated names of anonymous image-label accelerators
pub const ANON_ACCEL_NAME_PREFIX: &str = "anon_img_accel_";

static NAME_RE: OnceLock<Regex> = OnceLock::new();
static RT_RE: OnceLock<Regex> = OnceLock::new();
static OPT_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(&format!("^{}$", NAME_EXP)).unwrap())
}

fn rt_re() -> &'static Regex {
    RT_RE.get_or_init(|| Regex::new(&format!("^{}$", RT_EXP)).unwrap())
}

fn opt_re() -> &'static Regex {
    OPT_RE.get_or_init(|| {
        Regex::new(&format!(
            r"^(?:(?P<name>{name})=)?(?P<runtime>{rt})(?:@(?P<driver>[\w.-]+)(?:,(?P<options>.*))?)?$",
            name = NAME_EXP,
            rt = RT_EXP,
        ))
        .unwrap()
    })
}

/// Check whether an accelerator name matches the name grammar.
/// The empty name is accepted; context decides whether it is allowed.
pub fn validate_accel_name(name: &str) -> bool {
    name.is_empty() || name_re().is_match(name)
}

/// Check whether a runtime string matches the runtime grammar
pub fn validate_accel_runtime(rt: &str) -> bool {
    rt.is_empty() || rt_re().is_match(rt)
}

/// Parse one `--accel` argument into a persistent accelerator request
pub fn parse_accel_spec(spec: &str) -> Result<AcceleratorConfig> {
    let caps = opt_re()
        .captures(spec)
        .ok_or_else(|| Error::bad_request(format!("invalid accelerator option: \"{}\"", spec)))?;

    let mut cfg = AcceleratorConfig::new(
        caps.name("name").map(|m| m.as_str()).unwrap_or(""),
        caps.name("runtime").map(|m| m.as_str()).unwrap_or(""),
    );
    cfg.is_persistent = true;
    if let Some(driver) = caps.name("driver") {
        cfg.driver = driver.as_str().to_string();
    }
    if let Some(options) = caps.name("options") {
        if !options.as_str().is_empty() {
            cfg.options = options.as_str().split(',').map(str::to_string).collect();
        }
    }

    Ok(cfg)
}

/// Validate a parsed request against the requests collected so far
pub fn validate_accel(cfg: &AcceleratorConfig, existing: &[AcceleratorConfig]) -> Result<()> {
    if !cfg.name.is_empty() && existing.iter().any(|c| c.name == cfg.name) {
        return Err(Error::bad_request(format!(
            "Duplicated accelerator name: {}",
            cfg.name
        )));
    }
    Ok(())
}

/// Parse an image `runtime` label into non-persistent accelerator requests
pub fn parse_runtime_label(label: &str) -> Result<Vec<AcceleratorConfig>> {
    let mut configs = Vec::new();
    let mut anon_no = 0;

    for entry in label.split(';') {
        let parts: Vec<&str> = entry.split('=').collect();
        let cfg = match parts.as_slice() {
            [name, runtime]
                if validate_accel_name(name) && validate_accel_runtime(runtime)
                    && !name.is_empty() && !runtime.is_empty() =>
            {
                AcceleratorConfig::new(*name, *runtime)
            }
            [runtime] if rt_re().is_match(runtime) => {
                let cfg =
                    AcceleratorConfig::new(format!("{}{}", ANON_ACCEL_NAME_PREFIX, anon_no), *runtime);
                anon_no += 1;
                cfg
            }
            _ => {
                return Err(Error::bad_request(format!(
                    "Invalid runtime label: \"{}\"",
                    label
                )))
            }
        };
        configs.push(cfg);
    }

    Ok(configs)
}
