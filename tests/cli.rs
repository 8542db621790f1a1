use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Five sequences on a ring of neighbors with transitions 0 -> 1 -> 2 -> 4
/// and a shortcut 0 -> 3 -> 4 that is cancelled by the negative graph.
const ANNOTATIONS: &str = "\
O\tseqA\tMKV\tM-KV
O\tseqB\tMRV\tM-RV
O\tseqC\tMKI\tM-KI
O\tseqD\tMRI\tM-RI
O\tseqE\tLKV\tL-KV
E\tumap\t0\t0.0\t0.0
E\tumap\t1\t1.0\t0.5
E\tumap\t2\t2.0\t1.5
E\tumap\t3\t1.0\t-1.0
E\tumap\t4\t3.0\t2.0
D\t0\t1\t0.2
D\t1\t2\t0.2
D\t2\t3\t0.4
D\t3\t4\t0.1
D\t4\t0\t0.3
G\tvelocity_graph\t0\t1\t0.9
G\tvelocity_graph\t1\t2\t0.7
G\tvelocity_graph\t2\t4\t0.8
G\tvelocity_graph\t0\t3\t0.5
G\tvelocity_graph_neg\t0\t3\t0.5
G\tvelocity_graph_neg\t3\t4\t-0.2
V\tonehot_vocabulary\t0\tI
V\tonehot_vocabulary\t1\tK
V\tonehot_vocabulary\t2\tR
V\tonehot_vocabulary\t3\tV
S\tresidue_scores\t0\t0.1,0.2,0.0,-0.1
S\tresidue_scores\t1\t-0.3,-1.2,0.4,0.0
S\tresidue_scores\t2\t-0.9,0.1,0.3,-0.2
";

fn setup() -> anyhow::Result<(TempDir, PathBuf)> {
    let temp = TempDir::new()?;
    let input = temp.path().join("family.tsv");
    fs::write(&input, ANNOTATIONS)?;
    Ok((temp, input))
}

#[test]
fn path_between_endpoints() -> anyhow::Result<()> {
    let (temp, input) = setup()?;
    let output = temp.path().join("path.png");

    let mut cmd = Command::cargo_bin("evolook")?;
    cmd.arg("path")
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .arg("--source")
        .arg("0")
        .arg("--target")
        .arg("4")
        .arg("--background");

    cmd.assert().success().stdout("0,1,2,4\n");
    assert!(output.exists());

    let img = image::open(&output)?;
    assert_eq!((img.width(), img.height()), (640, 480));

    Ok(())
}

#[test]
fn path_as_svg() -> anyhow::Result<()> {
    let (temp, input) = setup()?;
    let output = temp.path().join("path.svg");

    let mut cmd = Command::cargo_bin("evolook")?;
    cmd.arg("path")
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .arg("--path")
        .arg("3,4,0");

    cmd.assert().success().stdout("3,4,0\n");

    let svg = fs::read_to_string(&output)?;
    assert_eq!(svg.matches("<line").count(), 2);
    assert_eq!(svg.matches("<circle").count(), 3);

    Ok(())
}

#[test]
fn path_needs_endpoints() -> anyhow::Result<()> {
    let (temp, input) = setup()?;
    let output = temp.path().join("path.png");

    let mut cmd = Command::cargo_bin("evolook")?;
    cmd.arg("path")
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .arg("--source")
        .arg("0");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Must provide path indices"));
    assert!(!output.exists());

    Ok(())
}

#[test]
fn path_reports_missing_endpoints_before_embedding() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let input = temp.path().join("no_umap.tsv");
    let no_umap: String = ANNOTATIONS
        .lines()
        .filter(|l| !l.starts_with("E\t"))
        .map(|l| format!("{}\n", l))
        .collect();
    fs::write(&input, no_umap)?;

    let mut cmd = Command::cargo_bin("evolook")?;
    cmd.arg("path")
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(temp.path().join("path.png"))
        .arg("-s")
        .arg("0")
        .arg("--background");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Must provide path indices"))
        .stderr(predicate::str::contains("X_umap").not());

    Ok(())
}

#[test]
fn path_rejects_corrupted_neighbors() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let input = temp.path().join("broken.tsv");
    let broken: String = ANNOTATIONS
        .lines()
        .filter(|l| !l.starts_with("D\t3"))
        .map(|l| format!("{}\n", l))
        .collect();
    fs::write(&input, broken)?;

    let mut cmd = Command::cargo_bin("evolook")?;
    cmd.arg("path")
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(temp.path().join("path.png"))
        .arg("-s")
        .arg("0")
        .arg("-e")
        .arg("4");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("neighbor graph seems to be corrupted"));

    Ok(())
}

#[test]
fn heatmap_saved_under_figdir() -> anyhow::Result<()> {
    let (temp, input) = setup()?;
    let figdir = temp.path().join("figs");

    let mut cmd = Command::cargo_bin("evolook")?;
    cmd.arg("heatmap")
        .arg("-i")
        .arg(&input)
        .arg("--save")
        .arg("scores.png")
        .arg("--percentile-keep")
        .arg("50")
        .arg("--figdir")
        .arg(&figdir)
        .arg("--dpi")
        .arg("40");

    cmd.assert().success();

    let img = image::open(figdir.join("evolocity_scores.png"))?;
    assert_eq!((img.width(), img.height()), (200, 200));

    Ok(())
}

#[test]
fn heatmap_needs_a_destination() -> anyhow::Result<()> {
    let (_temp, input) = setup()?;

    let mut cmd = Command::cargo_bin("evolook")?;
    cmd.arg("heatmap").arg("-i").arg(&input);

    cmd.assert().failure();

    Ok(())
}

#[test]
fn categories_for_lowest_scores() -> anyhow::Result<()> {
    let (temp, input) = setup()?;
    let figdir = temp.path().join("figures");

    let mut cmd = Command::cargo_bin("evolook")?;
    cmd.arg("categories")
        .arg("-i")
        .arg(&input)
        .arg("--n-plot")
        .arg("2")
        .arg("--reference")
        .arg("seqA")
        .arg("--namespace")
        .arg("demo")
        .arg("--figdir")
        .arg(&figdir);

    cmd.assert()
        .success()
        .stdout("1,2\n")
        .stderr(predicate::str::contains("Lowest score 1: K2"));

    assert!(figdir.join("umap_demo_pos1.png").exists());
    assert!(figdir.join("umap_demo_pos2.png").exists());

    let tsv = fs::read_to_string(figdir.join("demo.categories.tsv"))?;
    let lines: Vec<&str> = tsv.lines().collect();
    assert_eq!(lines[0], "name\tpos1\tpos2");
    assert_eq!(lines[2], "seqB\tR\tV");

    Ok(())
}

#[test]
fn categories_reject_bad_reference_alignment() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let input = temp.path().join("bad.tsv");
    fs::write(&input, ANNOTATIONS.replace("O\tseqA\tMKV\tM-KV", "O\tseqA\tMKV\tM-RV"))?;
    let figdir = temp.path().join("figures");

    let mut cmd = Command::cargo_bin("evolook")?;
    cmd.arg("categories")
        .arg("-i")
        .arg(&input)
        .arg("--reference")
        .arg("seqA")
        .arg("--figdir")
        .arg(&figdir);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("reference alignment disagrees"));
    assert!(!figdir.exists());

    Ok(())
}
