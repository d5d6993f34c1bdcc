//! Output processors: stateful consumers of line-oriented process output.
//!
//! A processor receives every stdout line in input order and turns the
//! stream into the task's result value. The result is read only after the
//! stream reaches end-of-file.

use serde_json::{Value, json};

/// Stateful line -> value consumer attached to a process task.
pub trait OutputProcessor: Send {
    /// Consume one line of stdout. Lines arrive in input order.
    fn line_received(&mut self, line: &str) -> anyhow::Result<()>;

    /// The accumulated result, or `None` when the stream produced nothing.
    /// Read only after end-of-stream.
    fn result(&mut self) -> Option<Value>;

    /// Value to use when the stream ended without producing a result.
    fn default_result(&self) -> Value {
        Value::Null
    }
}

/// Accumulates all output into a single string value.
#[derive(Default)]
pub struct StringOutputProcessor {
    lines: Vec<String>,
}

impl StringOutputProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputProcessor for StringOutputProcessor {
    fn line_received(&mut self, line: &str) -> anyhow::Result<()> {
        self.lines.push(line.to_string());
        Ok(())
    }

    fn result(&mut self) -> Option<Value> {
        if self.lines.is_empty() {
            None
        } else {
            Some(Value::String(self.lines.join("\n")))
        }
    }

    fn default_result(&self) -> Value {
        // Historical marker for a process that produced no output (e.g. a
        // detached server); kept for compatibility with existing consumers.
        json!("Process running")
    }
}

/// Collects each output line as one element of an aggregate list.
#[derive(Default)]
pub struct LineListOutputProcessor {
    items: Vec<Value>,
}

impl LineListOutputProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputProcessor for LineListOutputProcessor {
    fn line_received(&mut self, line: &str) -> anyhow::Result<()> {
        self.items.push(Value::String(line.to_string()));
        Ok(())
    }

    fn result(&mut self) -> Option<Value> {
        if self.items.is_empty() {
            None
        } else {
            Some(Value::Array(self.items.clone()))
        }
    }

    fn default_result(&self) -> Value {
        json!([])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_processor_joins_lines() {
        let mut processor = StringOutputProcessor::new();
        processor.line_received("hello").unwrap();
        processor.line_received("world").unwrap();
        assert_eq!(processor.result(), Some(json!("hello\nworld")));
    }

    #[test]
    fn string_processor_empty_stream_defaults_to_marker() {
        let mut processor = StringOutputProcessor::new();
        assert_eq!(processor.result(), None);
        assert_eq!(processor.default_result(), json!("Process running"));
    }

    #[test]
    fn line_list_processor_preserves_input_order() {
        let mut processor = LineListOutputProcessor::new();
        for line in ["a", "b", "c"] {
            processor.line_received(line).unwrap();
        }
        assert_eq!(processor.result(), Some(json!(["a", "b", "c"])));
        assert_eq!(LineListOutputProcessor::new().default_result(), json!([]));
    }
}
