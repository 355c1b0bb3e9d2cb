/// Abstraction over user-facing output.
///
/// Commands write through this trait instead of `println!`/`eprintln!` so
/// `--json` runs keep stdout machine-readable.
pub trait UserOutput: Send + Sync {
    /// Informational line on stdout.
    fn status(&self, message: &str);

    /// Warning on stderr.
    fn warning(&self, message: &str);

    /// Whether callers should emit JSON instead of prose.
    fn is_json(&self) -> bool;

    /// A JSON document on stdout.
    fn json(&self, value: &serde_json::Value) -> anyhow::Result<()>;

    /// A blank line separator.
    fn blank(&self);
}

/// Human-readable output.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn is_json(&self) -> bool {
        false
    }

    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn warning(&self, message: &str) {
        eprintln!("\x1b[33m{}\x1b[0m", message);
    }

    fn json(&self, value: &serde_json::Value) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn blank(&self) {
        println!();
    }
}

/// Machine-readable output: only JSON documents reach stdout.
pub struct JsonOutput;

impl UserOutput for JsonOutput {
    fn is_json(&self) -> bool {
        true
    }

    fn status(&self, _message: &str) {}

    fn warning(&self, message: &str) {
        eprintln!("{}", message);
    }

    fn json(&self, value: &serde_json::Value) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn blank(&self) {}
}

impl dyn UserOutput + '_ {
    /// Print `value` as JSON in JSON mode, otherwise run `human`.
    pub fn json_or<T: serde::Serialize>(&self, value: &T, human: impl FnOnce()) -> anyhow::Result<()> {
        if self.is_json() {
            self.json(&serde_json::to_value(value)?)
        } else {
            human();
            Ok(())
        }
    }
}

pub fn for_mode(json: bool) -> Box<dyn UserOutput> {
    if json {
        Box::new(JsonOutput)
    } else {
        Box::new(CliOutput)
    }
}
