//! Tree visualization: DOT dumps and browser monitor mode.
//!
//! External collaborators for debugging, not part of the engine proper. The
//! DOT dump colors nodes by verdict; monitor mode shells out to `dot` from
//! graphviz and refreshes a temporary HTML page the user opens once.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::config::Config;
use crate::task::TaskStatus;
use crate::tree::{Branch, Tree};
use crate::util;

/// Above this many nodes a full graph stops rendering usefully; discarded
/// branches get folded away.
const SIMPLIFY_THRESHOLD: usize = 100;

/// Writes `tree` as a DOT digraph.
///
/// With `simplify`, discarded nodes and their edges are omitted.
pub fn render<W: Write>(tree: &Tree, out: &mut W, simplify: bool) -> io::Result<()> {
    writeln!(out, "digraph tree {{ node [fontname=Arial];")?;

    let mut stack = vec![tree.root()];
    while let Some(id) = stack.pop() {
        if let Some(task) = tree.task(id) {
            let status = task.status();
            if simplify && status == TaskStatus::Discarded {
                continue;
            }
            let color = match status {
                TaskStatus::Failure => "red",
                TaskStatus::Success => "green",
                TaskStatus::Pending => "orange",
                TaskStatus::Discarded => "grey",
            };
            writeln!(
                out,
                "\"n{}\" [label=\"{} bytes\" style=filled fillcolor={}];",
                id.index(),
                task.size(),
                color
            )?;
        }

        for (branch, label) in [(Branch::Failure, "Failure"), (Branch::Success, "Success")] {
            if let Some(child) = tree.child(id, branch) {
                if tree.task(child).is_some() {
                    writeln!(
                        out,
                        " \"n{}\" -> \"n{}\" [label=\"{label}\"];",
                        id.index(),
                        child.index()
                    )?;
                }
                stack.push(child);
            }
        }
    }

    writeln!(out, "}}")?;
    Ok(())
}

/// Writes the final tree to `finaltree.XXXXXX.dot` in the working directory
/// and returns the path.
pub fn write_final_tree(tree: &Tree) -> io::Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("finaltree.")
        .suffix(".dot")
        .tempfile_in(".")?;
    let mut out = BufWriter::new(file.as_file());
    render(tree, &mut out, tree.len() > SIMPLIFY_THRESHOLD)?;
    out.flush()?;
    drop(out);
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Live progress view: a temp HTML page that re-loads a temp PNG which is
/// re-rendered on every driver iteration.
pub struct Monitor {
    png: PathBuf,
    html: PathBuf,
}

impl Monitor {
    /// Creates the HTML and image files and prints the URL to open.
    pub fn create(config: &Config) -> io::Result<Monitor> {
        let (_, png) = tempfile::Builder::new()
            .prefix("halfout-")
            .suffix(".png")
            .tempfile()?
            .keep()
            .map_err(|e| e.error)?;
        let html_file = tempfile::Builder::new()
            .prefix("halfout-")
            .suffix(".htm")
            .tempfile()?;
        let mut page = html_file.as_file();
        writeln!(
            page,
            "<!DOCTYPE html>\n<html><head><meta http-equiv=\"refresh\" content=\"1\"></head>\n\
             <body><img src=\"file://{}\" width=\"100%\"></body></html>",
            png.display()
        )?;
        let (_, html) = html_file.keep().map_err(|e| e.error)?;

        util::say(
            config,
            &format!("Use the URL <file://{}> for monitor mode.", html.display()),
        );
        Ok(Monitor { png, html })
    }

    /// Re-renders the tree image. Failures (no graphviz, broken tmp) are
    /// logged and otherwise ignored; the monitor is best effort.
    pub fn refresh(&mut self, tree: &Tree) {
        if let Err(err) = self.try_refresh(tree) {
            tracing::debug!("monitor refresh failed: {err}");
        }
    }

    fn try_refresh(&self, tree: &Tree) -> io::Result<()> {
        let dot_file = tempfile::NamedTempFile::new()?;
        let mut out = BufWriter::new(dot_file.as_file());
        render(tree, &mut out, tree.len() > SIMPLIFY_THRESHOLD)?;
        out.flush()?;
        drop(out);

        let img = tempfile::Builder::new().suffix(".png").tempfile()?;
        let status = Command::new("dot")
            .arg("-Gsize=10")
            .arg("-Tpng")
            .arg("-o")
            .arg(img.path())
            .arg(dot_file.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(io::Error::other("dot renderer failed"));
        }
        std::fs::rename(img.path(), &self.png)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.png);
        let _ = std::fs::remove_file(&self.html);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::ChunkState;
    use crate::task::Task;
    use std::sync::Arc;

    fn task(status: TaskStatus) -> Arc<Task> {
        let t = Task::new(
            tempfile::tempfile().unwrap(),
            8,
            ChunkState {
                offset: 0,
                chunksize: 8,
            },
        );
        if status != TaskStatus::Pending {
            t.set_status(status);
        }
        Arc::new(t)
    }

    #[test]
    fn renders_nodes_and_labeled_edges() {
        let mut tree = Tree::new(task(TaskStatus::Success));
        let child = tree.insert_child(tree.root(), Branch::Success, Some(task(TaskStatus::Failure)));
        tree.insert_child(tree.root(), Branch::Failure, None);

        let mut out = Vec::new();
        render(&tree, &mut out, false).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("digraph tree"));
        assert!(text.contains("fillcolor=green"));
        assert!(text.contains("fillcolor=red"));
        assert!(text.contains(&format!("\"n{}\"", child.index())));
        assert!(text.contains("[label=\"Success\"]"));
        // The empty placeholder produces no node and no edge.
        assert!(!text.contains("[label=\"Failure\"]"));
    }

    #[test]
    fn simplify_folds_discarded_branches() {
        let mut tree = Tree::new(task(TaskStatus::Success));
        tree.insert_child(tree.root(), Branch::Failure, Some(task(TaskStatus::Discarded)));

        let mut out = Vec::new();
        render(&tree, &mut out, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("grey"));
    }
}
