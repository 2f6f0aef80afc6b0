use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tensorboard_rs::summary_writer::SummaryWriter;
use tracing::debug;

use crate::error::Result;
use crate::model::GraphSummary;

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarEvent {
    pub tag: String,
    pub value: f64,
    pub step: u64,
}

/// Receives scalar summaries and the architecture description.
pub trait MetricsSink {
    fn emit(&mut self, tag: &str, value: f64, step: u64) -> Result<()>;

    fn record_graph(&mut self, graph: &GraphSummary) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// TensorBoard event files, one writer per phase.
///
/// A tag `pretrain/mse_loss` lands in `<logs>/pretrain` as `mse_loss`, and
/// `train/epoch/g_loss` in `<logs>/train` as `epoch/g_loss`. Tags without a
/// phase prefix go to `<logs>` itself. The graph summary is written to
/// `<logs>/graph.json`.
pub struct TensorboardSink {
    dir: PathBuf,
    writers: HashMap<String, SummaryWriter>,
}

impl TensorboardSink {
    pub fn create(dir: &Path) -> Result<TensorboardSink> {
        fs::create_dir_all(dir)?;
        Ok(TensorboardSink { dir: dir.to_path_buf(), writers: HashMap::new() })
    }

    fn writer(&mut self, phase: &str) -> Result<&mut SummaryWriter> {
        let dir = self.dir.join(phase);
        match self.writers.entry(phase.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                fs::create_dir_all(&dir)?;
                debug!(dir = %dir.display(), "opening summary writer");
                Ok(entry.insert(SummaryWriter::new(&dir)))
            }
        }
    }
}

fn split_tag(tag: &str) -> (&str, &str) {
    match tag.split_once('/') {
        Some((phase, name)) if !phase.is_empty() && !name.is_empty() => (phase, name),
        _ => ("", tag),
    }
}

impl MetricsSink for TensorboardSink {
    fn emit(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        debug!(tag, value, step, "scalar");
        let (phase, name) = split_tag(tag);
        self.writer(phase)?.add_scalar(name, value as f32, step as usize);
        Ok(())
    }

    fn record_graph(&mut self, graph: &GraphSummary) -> Result<()> {
        fs::write(self.dir.join("graph.json"), serde_json::to_string_pretty(graph)?)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.flush();
        }
        Ok(())
    }
}

impl Drop for TensorboardSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<ScalarEvent>,
    pub graph: Option<GraphSummary>,
}

impl MemorySink {
    pub fn tagged<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a ScalarEvent> + 'a {
        self.events.iter().filter(move |e| e.tag == tag)
    }

    pub fn count(&self, tag: &str) -> usize {
        self.tagged(tag).count()
    }
}

impl MetricsSink for MemorySink {
    fn emit(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.events.push(ScalarEvent { tag: tag.to_string(), value, step });
        Ok(())
    }

    fn record_graph(&mut self, graph: &GraphSummary) -> Result<()> {
        self.graph = Some(graph.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files_in(dir: &Path) -> usize {
        fs::read_dir(dir)
            .map(|entries| entries.filter_map(|e| e.ok()).filter(|e| e.path().is_file()).count())
            .unwrap_or(0)
    }

    #[test]
    fn tags_split_into_phase_and_name() {
        assert_eq!(split_tag("pretrain/mse_loss"), ("pretrain", "mse_loss"));
        assert_eq!(split_tag("val/epoch/d_loss"), ("val", "epoch/d_loss"));
        assert_eq!(split_tag("loose"), ("", "loose"));
        assert_eq!(split_tag("/odd"), ("", "/odd"));
    }

    #[test]
    fn tensorboard_sink_writes_one_event_file_per_phase() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sink = TensorboardSink::create(dir.path()).unwrap();
            sink.emit("pretrain/mse_loss", 0.5, 0).unwrap();
            sink.emit("pretrain/mse_loss", 0.25, 1).unwrap();
            sink.emit("train/g_loss", 1.5, 0).unwrap();
            sink.emit("train/epoch/g_loss", 1.5, 0).unwrap();
            sink.record_graph(&GraphSummary { generator: vec![], discriminator: vec![] }).unwrap();
            sink.flush().unwrap();
            assert_eq!(sink.writers.len(), 2);
        }
        assert_eq!(files_in(&dir.path().join("pretrain")), 1);
        assert_eq!(files_in(&dir.path().join("train")), 1);
        assert!(!dir.path().join("val").exists());
        assert!(dir.path().join("graph.json").is_file());
    }

    #[test]
    fn memory_sink_filters_by_tag() {
        let mut sink = MemorySink::default();
        sink.emit("train/g_loss", 1.0, 0).unwrap();
        sink.emit("train/d_loss", 2.0, 0).unwrap();
        sink.emit("train/g_loss", 3.0, 1).unwrap();
        assert_eq!(sink.count("train/g_loss"), 2);
        assert_eq!(sink.tagged("train/d_loss").next().unwrap().value, 2.0);
    }
}
