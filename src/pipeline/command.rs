//! Process descriptors.
//!
//! A [`Command`] describes one executable invocation plus optional stream
//! overrides. It is built by value and moved into a pipeline when the
//! pipeline is prepared, so the same descriptor is never shared between runs.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite};

/// Readable stream fed to the first stage's stdin.
pub type InputSource = Box<dyn AsyncRead + Send + Unpin>;

/// Writable stream receiving a stage's stdout or stderr.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Program and arguments of one stage, without any stream wiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    /// Create a spec with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Get the program name or path.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Get the arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = Path::new(&self.program)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.program);
        f.write_str(base)?;
        for arg in &self.args {
            write!(f, " {}", shell_escape::escape(Cow::Borrowed(arg.as_str())))?;
        }
        Ok(())
    }
}

/// Stream overrides detached from a [`Command`] at prepare time.
#[derive(Default)]
pub(crate) struct StreamOverrides {
    pub(crate) stdin: Option<InputSource>,
    pub(crate) stdout: Option<OutputSink>,
    pub(crate) stderr: Option<OutputSink>,
}

/// Descriptor of one pipeline stage.
pub struct Command {
    spec: CommandSpec,
    streams: StreamOverrides,
}

impl Command {
    /// Create a descriptor for the given program.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            spec: CommandSpec::new(program),
            streams: StreamOverrides::default(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed stdin from `reader`. Only valid on the first stage.
    #[must_use]
    pub fn stdin(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.streams.stdin = Some(Box::new(reader));
        self
    }

    /// Send stdout to `writer`. Only valid on the last stage.
    #[must_use]
    pub fn stdout(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.streams.stdout = Some(Box::new(writer));
        self
    }

    /// Send stderr to `writer`. Valid on any stage.
    #[must_use]
    pub fn stderr(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.streams.stderr = Some(Box::new(writer));
        self
    }

    /// Get the program and arguments.
    #[must_use]
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Whether an input source is attached.
    #[must_use]
    pub fn has_stdin(&self) -> bool {
        self.streams.stdin.is_some()
    }

    /// Whether an output sink is attached.
    #[must_use]
    pub fn has_stdout(&self) -> bool {
        self.streams.stdout.is_some()
    }

    /// Whether an error sink is attached.
    #[must_use]
    pub fn has_stderr(&self) -> bool {
        self.streams.stderr.is_some()
    }

    pub(crate) fn into_parts(self) -> (CommandSpec, StreamOverrides) {
        (self.spec, self.streams)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("program", &self.spec.program)
            .field("args", &self.spec.args)
            .field("stdin", &self.has_stdin())
            .field("stdout", &self.has_stdout())
            .field("stderr", &self.has_stderr())
            .finish()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.spec, f)
    }
}
