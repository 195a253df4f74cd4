//! Agent Outputs
//!
//! Agents record named time series through a `Producer`. Series are kept in
//! memory while the model runs and written as JSONL at the end, one line per
//! agent and series.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sim_types::{Identity, TimePoint};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::error::KernelError;

/// A series of `(time, value)` observations.
#[derive(Debug)]
pub struct Output<T> {
    name: String,
    values: Vec<(TimePoint, T)>,
}

/// Type-erased view of an output for serialization.
trait OutputSeries: Send + Sync {
    fn len(&self) -> usize;
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<T: Serialize + Send> OutputSeries for Mutex<Output<T>> {
    fn len(&self) -> usize {
        self.lock().values.len()
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(&self.lock().values)
    }
}

/// Shared handle an agent keeps to record into one of its outputs.
pub struct OutputHandle<T> {
    inner: Arc<Mutex<Output<T>>>,
}

impl<T> Clone for OutputHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for OutputHandle<T> {
    /// A detached handle; values put into it are not written anywhere.
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Output {
                name: String::new(),
                values: Vec::new(),
            })),
        }
    }
}

impl<T> OutputHandle<T> {
    pub fn put(&self, time: TimePoint, value: T) {
        self.inner.lock().values.push((time, value));
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> OutputHandle<T> {
    pub fn last(&self) -> Option<(TimePoint, T)> {
        self.inner.lock().values.last().cloned()
    }

    pub fn values(&self) -> Vec<(TimePoint, T)> {
        self.inner.lock().values.clone()
    }
}

impl<T> std::fmt::Debug for OutputHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputHandle")
            .field("name", &self.inner.lock().name)
            .field("len", &self.inner.lock().values.len())
            .finish()
    }
}

/// The set of outputs one agent produces.
///
/// Serializes as a map of series name to recorded values. A deserialized
/// producer holds those values until the agent re-creates each output by
/// name, which is how outputs follow an agent across nodes.
#[derive(Default)]
pub struct Producer {
    outputs: BTreeMap<String, Arc<dyn OutputSeries>>,
    restored: BTreeMap<String, serde_json::Value>,
}

impl Producer {
    /// Creates the output `name`, resuming any values restored for it.
    pub fn create_output<T>(&mut self, name: impl Into<String>) -> Result<OutputHandle<T>, KernelError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let name = name.into();
        let values = match self.restored.remove(&name) {
            Some(json) => serde_json::from_value(json)?,
            None => Vec::new(),
        };
        let inner = Arc::new(Mutex::new(Output {
            name: name.clone(),
            values,
        }));
        self.outputs.insert(name, inner.clone() as Arc<dyn OutputSeries>);
        Ok(OutputHandle { inner })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.restored.is_empty()
    }

    /// Total observations over all outputs.
    pub fn observations(&self) -> usize {
        self.outputs.values().map(|o| o.len()).sum()
    }

    /// All series as JSON, including restored series not yet re-created.
    pub fn to_json(&self) -> Result<BTreeMap<String, serde_json::Value>, serde_json::Error> {
        let mut series = self.restored.clone();
        for (name, output) in &self.outputs {
            series.insert(name.clone(), output.to_json()?);
        }
        Ok(series)
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .field("restored", &self.restored.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Serialize for Producer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Producer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self {
            outputs: BTreeMap::new(),
            restored: BTreeMap::deserialize(deserializer)?,
        })
    }
}

/// One line of the outputs file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub agent: Identity,
    pub output: String,
    pub values: serde_json::Value,
}

/// Append-only JSONL writer for output records.
pub struct OutputWriter {
    writer: Option<BufWriter<File>>,
    record_count: u64,
}

impl OutputWriter {
    /// Create a writer truncating the file at `path`
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            writer: Some(BufWriter::new(file)),
            record_count: 0,
        })
    }

    /// Create a writer that discards records
    pub fn null() -> Self {
        Self {
            writer: None,
            record_count: 0,
        }
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn write(&mut self, record: &OutputRecord) -> std::io::Result<()> {
        self.record_count += 1;
        if let Some(ref mut writer) = self.writer {
            let json = serde_json::to_string(record)?;
            writeln!(writer, "{}", json)?;
        }
        Ok(())
    }

    /// Writes every series of every agent, in identity order.
    pub fn write_all(
        &mut self,
        outputs: &BTreeMap<Identity, BTreeMap<String, serde_json::Value>>,
    ) -> std::io::Result<()> {
        for (agent, series) in outputs {
            for (output, values) in series {
                self.write(&OutputRecord {
                    agent: agent.clone(),
                    output: output.clone(),
                    values: values.clone(),
                })?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        if let Some(ref mut writer) = self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for OutputWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to flush output writer");
        }
    }
}
