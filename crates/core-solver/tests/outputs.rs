//! Output serialization: sampled CSV trajectories, step counts, dot graphs.

use core_config::{Method, Options};
use core_model::LinearModel;
use core_solver::Solver;

const DECAY: &str = r#"
    name = "decay"
    t_end = 2.0

    [[state]]
    name = "x"
    start = 1.0
    [state.der]
    x = -1.0
"#;

#[test]
fn sampled_csv_and_steps_and_dot_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Options {
        method: Method::Qss2,
        dt_out: Some(0.5),
        t_end: Some(2.0),
        out_dir: dir.path().to_path_buf(),
        ..Options::default()
    };
    cfg.output.steps = true;
    cfg.dot.dependency = true;

    let model = LinearModel::from_str_named(DECAY, "decay").unwrap();
    let mut s = Solver::new(Box::new(model), cfg).unwrap();
    s.init().unwrap();
    s.simulate().unwrap();

    let csv = std::fs::read_to_string(dir.path().join("x.csv")).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next().unwrap(), "t,x");
    // t0 sample plus one per dtOut multiple, with event rows interleaved.
    let rows: Vec<&str> = lines.collect();
    assert!(rows.len() >= 5, "expected samples, got {rows:?}");
    let first: Vec<&str> = rows[0].split(',').collect();
    assert_eq!(first[0], "0");
    assert_eq!(first[1], "1");

    let steps = std::fs::read_to_string(dir.path().join("steps.csv")).unwrap();
    assert!(steps.lines().any(|l| l.starts_with("x,")));

    let dot = std::fs::read_to_string(dir.path().join("decay_deps.gv")).unwrap();
    assert!(dot.contains("\"x\" -> \"x\";"), "self-dependency edge: {dot}");
}

#[test]
fn variable_filter_limits_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Options {
        method: Method::Qss2,
        dt_out: Some(0.5),
        t_end: Some(1.0),
        out_dir: dir.path().to_path_buf(),
        ..Options::default()
    };
    cfg.var_filter.push(core_config::spec_regex("nomatch*").unwrap());

    let model = LinearModel::from_str_named(DECAY, "decay").unwrap();
    let mut s = Solver::new(Box::new(model), cfg).unwrap();
    s.init().unwrap();
    s.simulate().unwrap();
    assert!(!dir.path().join("x.csv").exists());
}
