//! Option-file loading: discovery tolerance, parse errors, and merge
//! precedence against defaults.

use core_config::{load_file, Method, Options};
use std::io::Write;

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let file = load_file(Some(dir.path().join("nope.toml"))).unwrap();
    let mut opts = Options::default();
    opts.apply_file(&file).unwrap();
    assert_eq!(opts.method, Method::Qss2);
    assert_eq!(opts.rtol, 1.0e-4);
}

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qsolve.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(
        f,
        r#"
        method = "rQSS3"
        ztol = 0.0
        dt_nd = 1e-7
        t_end = 12.5
        dep = ["x*:u"]
        var = ["x?"]
        "#
    )
    .unwrap();
    drop(f);

    let file = load_file(Some(path)).unwrap();
    let mut opts = Options::default();
    opts.apply_file(&file).unwrap();
    opts.validate().unwrap();
    assert_eq!(opts.method, Method::Rqss3);
    assert_eq!(opts.ztol, 0.0);
    assert_eq!(opts.dt_nd, 1.0e-7);
    assert_eq!(opts.t_end, Some(12.5));
    assert_eq!(opts.dep.len(), 1);
    assert!(opts.dep[0].matches_var("x12"));
    assert!(opts.dep[0].matches_dep("u"));
    assert_eq!(opts.var_filter.len(), 1);
}

#[test]
fn malformed_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qsolve.toml");
    std::fs::write(&path, "method = ").unwrap();
    assert!(load_file(Some(path)).is_err());
}
