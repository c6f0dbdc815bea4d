//! Result serialization: per-variable CSV trajectories, requantization step
//! counts, and dot graphs of the dependency structure.
//!
//! Writers buffer and flush on `finish` (or drop); the solver defers writes
//! to Stage Final so no I/O happens mid-stage.

use anyhow::{Context, Result};
use core_time::Time;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Buffered CSV writer for one variable's trajectory samples.
pub struct TrajWriter {
    name: String,
    path: PathBuf,
    out: BufWriter<File>,
    rows: u64,
}

impl TrajWriter {
    /// Create `<dir>/<name>.csv` with a `t,value` header. Slashes and dots
    /// in variable names are mapped to safe filename characters.
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        let file_name = format!("{}.csv", sanitize(name));
        let path = dir.join(file_name);
        let file = File::create(&path)
            .with_context(|| format!("creating output file {}", path.display()))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "t,{name}")?;
        Ok(Self {
            name: name.to_string(),
            path,
            out,
            rows: 0,
        })
    }

    pub fn write(&mut self, t: Time, value: f64) -> Result<()> {
        writeln!(self.out, "{t},{value}")?;
        self.rows += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        tracing::debug!(
            target: "output",
            name = %self.name,
            rows = self.rows,
            path = %self.path.display(),
            "trajectory file written"
        );
        Ok(())
    }
}

/// Requantization step counts, one `name,count` row per variable.
pub fn write_steps(dir: &Path, counts: &[(String, u64)]) -> Result<PathBuf> {
    let path = dir.join("steps.csv");
    let file =
        File::create(&path).with_context(|| format!("creating step file {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "variable,requantizations")?;
    for (name, n) in counts {
        writeln!(out, "{name},{n}")?;
    }
    out.flush()?;
    Ok(path)
}

/// Dot graph of dependency edges (observee -> observer).
pub fn write_dot(dir: &Path, graph_name: &str, edges: &[(String, String)]) -> Result<PathBuf> {
    let path = dir.join(format!("{}.gv", sanitize(graph_name)));
    let file =
        File::create(&path).with_context(|| format!("creating dot file {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "digraph \"{graph_name}\" {{")?;
    writeln!(out, "  rankdir=LR;")?;
    for (from, to) in edges {
        writeln!(out, "  \"{from}\" -> \"{to}\";")?;
    }
    writeln!(out, "}}")?;
    out.flush()?;
    Ok(path)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trajectory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = TrajWriter::create(dir.path(), "x1").unwrap();
        w.write(0.0, 1.0).unwrap();
        w.write(0.5, 0.6065).unwrap();
        w.finish().unwrap();
        let text = std::fs::read_to_string(dir.path().join("x1.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "t,x1");
        assert_eq!(lines[1], "0,1");
        assert_eq!(lines[2], "0.5,0.6065");
    }

    #[test]
    fn dot_graph_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_dot(
            dir.path(),
            "deps",
            &[("x".into(), "y".into()), ("y".into(), "x".into())],
        )
        .unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("digraph"));
        assert!(text.contains("\"x\" -> \"y\";"));
        assert!(text.contains("\"y\" -> \"x\";"));
    }

    #[test]
    fn names_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let w = TrajWriter::create(dir.path(), "der(x)/a").unwrap();
        w.finish().unwrap();
        assert!(dir.path().join("der(x)_a.csv").exists());
    }

    #[test]
    fn steps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_steps(dir.path(), &[("x".into(), 42)]).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("x,42"));
    }
}
