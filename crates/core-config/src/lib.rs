//! Solver options: defaults, optional `qsolve.toml` file layer, and the
//! merge surface the CLI writes through.
//!
//! Precedence is CLI over file over defaults. The file uses the same names
//! as the CLI flags; unknown fields are rejected so typos surface at setup
//! instead of silently running with defaults.

use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },
    #[error("config file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("unknown QSS method: {0}")]
    UnknownMethod(String),
    #[error("invalid option: {0}")]
    Invalid(String),
    #[error("bad variable spec {spec}: {message}")]
    BadSpec { spec: String, message: String },
}

/// QSS method selection: flavor and order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Qss1,
    Qss2,
    Qss3,
    Liqss1,
    Liqss2,
    Liqss3,
    Rqss1,
    Rqss2,
    Rqss3,
}

impl Method {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_uppercase().as_str() {
            "QSS1" => Ok(Method::Qss1),
            "QSS2" => Ok(Method::Qss2),
            "QSS3" => Ok(Method::Qss3),
            "LIQSS1" => Ok(Method::Liqss1),
            "LIQSS2" => Ok(Method::Liqss2),
            "LIQSS3" => Ok(Method::Liqss3),
            "RQSS1" | "XQSS1" => Ok(Method::Rqss1),
            "RQSS2" | "XQSS2" => Ok(Method::Rqss2),
            "RQSS3" | "XQSS3" => Ok(Method::Rqss3),
            _ => Err(ConfigError::UnknownMethod(s.to_string())),
        }
    }

    pub fn order(self) -> u8 {
        match self {
            Method::Qss1 | Method::Liqss1 | Method::Rqss1 => 1,
            Method::Qss2 | Method::Liqss2 | Method::Rqss2 => 2,
            Method::Qss3 | Method::Liqss3 | Method::Rqss3 => 3,
        }
    }

    pub fn is_liqss(self) -> bool {
        matches!(self, Method::Liqss1 | Method::Liqss2 | Method::Liqss3)
    }

    pub fn is_relax(self) -> bool {
        matches!(self, Method::Rqss1 | Method::Rqss2 | Method::Rqss3)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Qss1 => "QSS1",
            Method::Qss2 => "QSS2",
            Method::Qss3 => "QSS3",
            Method::Liqss1 => "LIQSS1",
            Method::Liqss2 => "LIQSS2",
            Method::Liqss3 => "LIQSS3",
            Method::Rqss1 => "rQSS1",
            Method::Rqss2 => "rQSS2",
            Method::Rqss3 => "rQSS3",
        };
        f.write_str(s)
    }
}

/// Output selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSel {
    /// Requantization events in the trajectory files.
    pub requantizations: bool,
    /// Zero-crossing event log (`crossings.csv`).
    pub zero_crossings: bool,
    /// Handler/discrete events in the trajectory files.
    pub discrete: bool,
    /// Sampled trajectories at dtOut.
    pub sampled: bool,
    /// Requantization step counts file.
    pub steps: bool,
}

impl Default for OutputSel {
    fn default() -> Self {
        Self {
            requantizations: true,
            zero_crossings: false,
            discrete: true,
            sampled: true,
            steps: false,
        }
    }
}

/// Dot graph selections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DotSel {
    /// Full dependency graph.
    pub dependency: bool,
    /// Computational observer graph.
    pub observer: bool,
}

/// A dependency augmentation spec: variables matching `spec` additionally
/// depend on variables matching each of `deps`.
#[derive(Debug, Clone)]
pub struct DepSpec {
    pub spec: Regex,
    pub deps: Vec<Regex>,
}

impl DepSpec {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        // Form: var or var:dep1,dep2
        let (var, deps) = match text.split_once(':') {
            Some((v, d)) => (v, d.split(',').collect::<Vec<_>>()),
            None => (text, Vec::new()),
        };
        Ok(Self {
            spec: spec_regex(var)?,
            deps: deps
                .into_iter()
                .map(spec_regex)
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn matches_var(&self, name: &str) -> bool {
        self.spec.is_match(name)
    }

    pub fn matches_dep(&self, name: &str) -> bool {
        self.deps.iter().any(|d| d.is_match(name))
    }
}

/// Glob-style variable spec to anchored regex: `?` matches one character,
/// `*` any run, other regex metacharacters are literal.
pub fn spec_regex(spec: &str) -> Result<Regex, ConfigError> {
    let mut re = String::from("^");
    for ch in spec.chars() {
        match ch {
            '?' => re.push('.'),
            '*' => re.push_str(".*"),
            c if "\\.^$|()[]{}+".contains(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| ConfigError::BadSpec {
        spec: spec.to_string(),
        message: e.to_string(),
    })
}

/// Resolved option set.
#[derive(Debug, Clone)]
pub struct Options {
    pub method: Method,
    pub rtol: f64,
    pub atol: f64,
    pub ztol: f64,
    pub zmul: f64,
    pub dt_min: f64,
    pub dt_max: f64,
    pub dt_inf: f64,
    pub dt_zmax: f64,
    pub dt_zc: f64,
    pub dt_nd: f64,
    pub dt_nd_max: f64,
    pub dt_nd_optimizer: bool,
    pub dt_con: f64,
    pub dt_out: Option<f64>,
    pub t_beg: Option<f64>,
    pub t_end: Option<f64>,
    pub inflection: bool,
    pub inflection_frac: f64,
    pub refine: bool,
    pub clipping: bool,
    pub clip: f64,
    /// Event-indicator tracking policy (0 both, 1 passive-handler only,
    /// 2 no-handler only).
    pub ei: u8,
    pub output: OutputSel,
    pub dot: DotSel,
    /// Input variable name -> source function spec.
    pub fxn: BTreeMap<String, String>,
    /// Input variable name -> output variable name (connections).
    pub con: BTreeMap<String, String>,
    /// Dependency augmentation.
    pub dep: Vec<DepSpec>,
    /// Variable output filter specs (empty: all).
    pub var_filter: Vec<Regex>,
    pub out_dir: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            method: Method::Qss2,
            rtol: 1.0e-4,
            atol: 1.0e-6,
            ztol: 1.0e-6,
            zmul: 1.01,
            dt_min: 0.0,
            dt_max: f64::INFINITY,
            dt_inf: f64::INFINITY,
            dt_zmax: 0.0,
            dt_zc: 1.0e-9,
            dt_nd: 1.0e-6,
            dt_nd_max: 1.0e-3,
            dt_nd_optimizer: false,
            dt_con: 0.0,
            dt_out: None,
            t_beg: None,
            t_end: None,
            inflection: false,
            inflection_frac: 0.25,
            refine: false,
            clipping: false,
            clip: 1.0e-12,
            ei: 0,
            output: OutputSel::default(),
            dot: DotSel::default(),
            fxn: BTreeMap::new(),
            con: BTreeMap::new(),
            dep: Vec::new(),
            var_filter: Vec::new(),
            out_dir: PathBuf::from("."),
        }
    }
}

impl Options {
    /// Validate cross-field constraints; call after all layers are merged.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rtol <= 0.0 {
            return Err(ConfigError::Invalid("rTol must be positive".into()));
        }
        if self.atol <= 0.0 {
            return Err(ConfigError::Invalid("aTol must be positive".into()));
        }
        if self.ztol < 0.0 {
            return Err(ConfigError::Invalid("zTol must be non-negative".into()));
        }
        if self.dt_min > self.dt_max {
            return Err(ConfigError::Invalid("dtMin must not exceed dtMax".into()));
        }
        if self.dt_nd <= 0.0 {
            return Err(ConfigError::Invalid("dtND must be positive".into()));
        }
        if self.dt_con < 0.0 {
            return Err(ConfigError::Invalid("dtCon must be non-negative".into()));
        }
        if let (Some(b), Some(e)) = (self.t_beg, self.t_end) {
            if e < b {
                return Err(ConfigError::Invalid("tEnd must not precede tBeg".into()));
            }
        }
        if self.ei > 2 {
            return Err(ConfigError::Invalid("EI policy must be 0, 1, or 2".into()));
        }
        Ok(())
    }

    /// Apply the optional `qsolve.toml` layer under this option set.
    pub fn apply_file(&mut self, file: &ConfigFile) -> Result<(), ConfigError> {
        if let Some(m) = &file.method {
            self.method = Method::parse(m)?;
        }
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $( if let Some(v) = file.$field { self.$field = v; } )*
            };
        }
        take!(
            rtol, atol, ztol, zmul, dt_min, dt_max, dt_inf, dt_zmax, dt_zc, dt_nd, dt_nd_max,
            dt_nd_optimizer, dt_con, inflection, inflection_frac, refine, clipping, clip, ei,
        );
        if let Some(v) = file.dt_out {
            self.dt_out = Some(v);
        }
        if let Some(v) = file.t_beg {
            self.t_beg = Some(v);
        }
        if let Some(v) = file.t_end {
            self.t_end = Some(v);
        }
        for (k, v) in &file.fxn {
            self.fxn.insert(k.clone(), v.clone());
        }
        for (k, v) in &file.con {
            self.con.insert(k.clone(), v.clone());
        }
        for d in &file.dep {
            self.dep.push(DepSpec::parse(d)?);
        }
        for v in &file.var {
            self.var_filter.push(spec_regex(v)?);
        }
        Ok(())
    }
}

/// On-disk option file, flat key space mirroring the CLI flags.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub method: Option<String>,
    pub rtol: Option<f64>,
    pub atol: Option<f64>,
    pub ztol: Option<f64>,
    pub zmul: Option<f64>,
    pub dt_min: Option<f64>,
    pub dt_max: Option<f64>,
    pub dt_inf: Option<f64>,
    pub dt_zmax: Option<f64>,
    pub dt_zc: Option<f64>,
    pub dt_nd: Option<f64>,
    pub dt_nd_max: Option<f64>,
    pub dt_nd_optimizer: Option<bool>,
    pub dt_con: Option<f64>,
    pub dt_out: Option<f64>,
    pub t_beg: Option<f64>,
    pub t_end: Option<f64>,
    pub inflection: Option<bool>,
    pub inflection_frac: Option<f64>,
    pub refine: Option<bool>,
    pub clipping: Option<bool>,
    pub clip: Option<f64>,
    pub ei: Option<u8>,
    #[serde(default)]
    pub fxn: BTreeMap<String, String>,
    #[serde(default)]
    pub con: BTreeMap<String, String>,
    #[serde(default)]
    pub dep: Vec<String>,
    #[serde(default)]
    pub var: Vec<String>,
}

/// Locate `qsolve.toml`: working directory first, then the platform config
/// directory.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("qsolve.toml");
    if local.exists() {
        return local;
    }
    if let Ok(home) = std::env::var("HOME") {
        return Path::new(&home).join(".config").join("qsolve").join("qsolve.toml");
    }
    PathBuf::from("qsolve.toml")
}

/// Load the file layer from `path` (or discovery), tolerating a missing file.
pub fn load_file(path: Option<PathBuf>) -> Result<ConfigFile, ConfigError> {
    let path = path.unwrap_or_else(discover);
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            tracing::info!(target: "config", path = %path.display(), "loaded options file");
            toml::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::File {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn method_parse_and_order() {
        assert_eq!(Method::parse("QSS2").unwrap(), Method::Qss2);
        assert_eq!(Method::parse("liqss3").unwrap(), Method::Liqss3);
        assert_eq!(Method::parse("rQSS2").unwrap(), Method::Rqss2);
        assert_eq!(Method::parse("xQSS3").unwrap(), Method::Rqss3);
        assert!(Method::parse("QSS4").is_err());
        assert_eq!(Method::Liqss3.order(), 3);
        assert!(Method::Liqss1.is_liqss());
        assert!(Method::Rqss2.is_relax());
    }

    #[test]
    fn spec_regex_globs() {
        let re = spec_regex("x*.v?").unwrap();
        assert!(re.is_match("x1.va"));
        assert!(re.is_match("xfoo.vb"));
        assert!(!re.is_match("y.va"));
        assert!(!re.is_match("x1.vaa"));
    }

    #[test]
    fn dep_spec_parse() {
        let d = DepSpec::parse("x?:u,v*").unwrap();
        assert!(d.matches_var("x1"));
        assert!(!d.matches_var("x11"));
        assert!(d.matches_dep("u"));
        assert!(d.matches_dep("v99"));
        assert!(!d.matches_dep("w"));
    }

    #[test]
    fn file_layer_merges_under_defaults() {
        let file: ConfigFile = toml::from_str(
            r#"
            method = "LIQSS2"
            rtol = 1e-5
            inflection = true
            [fxn]
            u = "sin[1,2,0]"
            "#,
        )
        .unwrap();
        let mut opts = Options::default();
        opts.apply_file(&file).unwrap();
        assert_eq!(opts.method, Method::Liqss2);
        assert_eq!(opts.rtol, 1e-5);
        assert!(opts.inflection);
        assert_eq!(opts.atol, 1.0e-6); // default retained
        assert_eq!(opts.fxn.get("u").unwrap(), "sin[1,2,0]");
        opts.validate().unwrap();
    }

    #[test]
    fn unknown_file_key_is_rejected() {
        let r: Result<ConfigFile, _> = toml::from_str("rtool = 1e-5");
        assert!(r.is_err());
    }

    #[test]
    fn validation_catches_bad_ranges() {
        let mut opts = Options::default();
        opts.rtol = 0.0;
        assert!(opts.validate().is_err());
        let mut opts = Options::default();
        opts.dt_min = 2.0;
        opts.dt_max = 1.0;
        assert!(opts.validate().is_err());
        let mut opts = Options::default();
        opts.t_beg = Some(1.0);
        opts.t_end = Some(0.0);
        assert!(opts.validate().is_err());
    }
}
