//! The platform-compiler invocation boundary.
//!
//! The registry hands a [`Compiler`] a set of sources, an output directory
//! and a search path, and expects diagnostics to stream back through a
//! callback *while the compiler runs* — a long compile should surface its
//! warnings as they are produced, not in one batch at the end. The call is
//! synchronous from the registry's point of view even if the compiler
//! parallelizes internally.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::error::CompilerFailure;

/// One discrete compiler message. Multi-line entries (a lead line plus
/// indented detail) arrive as a single diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub text: String,
}

/// Everything a compiler needs for one unit compilation.
pub struct CompileJob<'a> {
    pub unit: &'a str,
    pub sources: &'a [Utf8PathBuf],
    pub out_dir: &'a Utf8Path,
    pub search_path: &'a [Utf8PathBuf],
    pub deprecations: bool,
}

pub trait Compiler {
    /// File extension of unit source files.
    fn source_extension(&self) -> &str;

    /// The platform's binary-bundle extension, used to validate descriptor
    /// artifact paths.
    fn bundle_extension(&self) -> &str;

    fn compile(
        &self,
        job: &CompileJob<'_>,
        sink: &mut dyn FnMut(Diagnostic),
    ) -> Result<(), CompilerFailure>;
}

/// Glues raw compiler output lines into discrete diagnostics: an indented
/// line continues the previous message, anything else begins a new one, and
/// a blank line ends the current one.
#[derive(Default)]
pub struct Coalescer {
    buffer: String,
}

impl Coalescer {
    pub fn push(&mut self, line: &str, sink: &mut dyn FnMut(Diagnostic)) {
        if line.trim().is_empty() {
            self.finish(sink);
            return;
        }

        let continuation = line.starts_with([' ', '\t']);
        if continuation && !self.buffer.is_empty() {
            self.buffer.push('\n');
            self.buffer.push_str(line);
            return;
        }

        self.finish(sink);
        self.buffer.push_str(line);
    }

    pub fn finish(&mut self, sink: &mut dyn FnMut(Diagnostic)) {
        if !self.buffer.is_empty() {
            sink(Diagnostic {
                text: std::mem::take(&mut self.buffer),
            });
        }
    }
}

/// Stock [`Compiler`] wrapping an external command-line compiler.
///
/// Invocation shape: `<program> <args> [<deprecation args>] (<search flag>
/// <path>)* <out flag> <out dir> <sources>*`, with stderr piped through the
/// [`Coalescer`] into the caller's sink as it is produced.
pub struct CommandCompiler {
    program: String,
    args: Vec<String>,
    deprecation_args: Vec<String>,
    search_flag: String,
    out_flag: String,
    source_ext: String,
    bundle_ext: String,
}

impl CommandCompiler {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            deprecation_args: vec!["--deprecation".into()],
            search_flag: "-L".into(),
            out_flag: "-o".into(),
            source_ext: "unit".into(),
            bundle_ext: std::env::consts::DLL_EXTENSION.into(),
        }
    }

    /// Append a fixed argument passed on every invocation.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Arguments appended when deprecation diagnostics are requested.
    pub fn deprecation_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.deprecation_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn search_flag(mut self, flag: impl Into<String>) -> Self {
        self.search_flag = flag.into();
        self
    }

    pub fn out_flag(mut self, flag: impl Into<String>) -> Self {
        self.out_flag = flag.into();
        self
    }

    pub fn source_extension(mut self, ext: impl Into<String>) -> Self {
        self.source_ext = ext.into();
        self
    }

    pub fn bundle_extension(mut self, ext: impl Into<String>) -> Self {
        self.bundle_ext = ext.into();
        self
    }
}

impl Compiler for CommandCompiler {
    fn source_extension(&self) -> &str {
        &self.source_ext
    }

    fn bundle_extension(&self) -> &str {
        &self.bundle_ext
    }

    fn compile(
        &self,
        job: &CompileJob<'_>,
        sink: &mut dyn FnMut(Diagnostic),
    ) -> Result<(), CompilerFailure> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if job.deprecations {
            cmd.args(&self.deprecation_args);
        }
        for path in job.search_path {
            cmd.arg(&self.search_flag).arg(path.as_str());
        }
        cmd.arg(&self.out_flag).arg(job.out_dir.as_str());
        for source in job.sources {
            cmd.arg(source.as_str());
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        tracing::debug!(unit = job.unit, program = %self.program, "invoking compiler");

        let mut child = cmd.spawn().map_err(|source| CompilerFailure::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stderr = child.stderr.take().expect("stderr was piped");
        let mut coalescer = Coalescer::default();

        for line in BufReader::new(stderr).lines() {
            coalescer.push(&line?, sink);
        }
        coalescer.finish(sink);

        let status = child.wait()?;
        if !status.success() {
            return Err(CompilerFailure::Exit {
                code: status.code(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(lines: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        let mut sink = |d: Diagnostic| out.push(d.text);
        let mut coalescer = Coalescer::default();

        for line in lines {
            coalescer.push(line, &mut sink);
        }
        coalescer.finish(&mut sink);
        out
    }

    #[test]
    fn indented_lines_continue_the_previous_message() {
        let out = run(&[
            "main.unit:3: use of deprecated symbol",
            "    frob(x)",
            "    ^",
            "main.unit:9: type mismatch",
        ]);

        assert_eq!(
            out,
            vec![
                "main.unit:3: use of deprecated symbol\n    frob(x)\n    ^",
                "main.unit:9: type mismatch",
            ]
        );
    }

    #[test]
    fn blank_lines_end_the_current_message() {
        let out = run(&["first", "", "  indented after blank"]);
        assert_eq!(out, vec!["first", "  indented after blank"]);
    }

    #[test]
    fn finish_flushes_the_tail() {
        let out = run(&["only message", "  with detail"]);
        assert_eq!(out, vec!["only message\n  with detail"]);
    }

    #[test]
    fn no_output_means_no_diagnostics() {
        assert!(run(&[]).is_empty());
    }
}
