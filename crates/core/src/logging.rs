use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "hyper=warn,hyper_util=warn,reqwest=warn,h2=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "genvid";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";
pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

/// Targets the file sink records at debug level under implicit filter
/// selection, so provider retries and poll progress survive in the log files.
const FILE_DEBUG_TARGETS: [&str; 2] = ["genvid_core::provider", "genvid_core::poller"];

/// Keys whose values never reach a log sink. Matched case-insensitively.
const SECRET_KEYS: [&str; 7] = [
    "authorization",
    "api_key",
    "api-key",
    "apikey",
    "token",
    "secret",
    "password",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLogMode {
    Cli,
    Server,
}

impl RuntimeLogMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Server => "server",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilters {
    pub console: String,
    pub file: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilters,
    pub file_sink: FileSink,
}

/// Where persistent logs go, or why they cannot.
#[derive(Debug)]
pub enum FileSink {
    Rolling {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    ConsoleOnly {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

/// `MakeWriter` wrapper that masks secrets before bytes reach the inner
/// writer.
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

/// Buffers partial lines so a secret split across writes is still masked.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

pub fn redacting_make_writer<M>(inner: M) -> RedactingMakeWriter<M> {
    RedactingMakeWriter { inner }
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let redacted = redact_sensitive_text(&String::from_utf8_lossy(line));
        self.inner.write_all(redacted.as_bytes())
    }

    fn drain_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let rest = std::mem::take(&mut self.pending);
        self.write_line(&rest)
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            self.write_line(&line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_pending()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: open_file_sink(options),
    }
}

/// Daily rolling appender under `<data_dir>/logs`, or the reason logging
/// stays console-only.
pub fn open_file_sink(options: &LoggingInitOptions) -> FileSink {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSink::ConsoleOnly {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSink::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention_files = match options.retention_files {
        0 => DEFAULT_LOG_RETENTION_FILES,
        files => files,
    };
    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSink::Rolling { log_dir, appender },
        Err(error) => FileSink::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Filter precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then
/// the default. An explicit choice (flag or `-v`) is used verbatim for both
/// sinks; otherwise the HTTP stack is quieted and the file sink additionally
/// keeps provider and poller debug output.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilters {
    let explicit = match (options.cli_log_filter.as_deref(), options.verbose) {
        (Some(filter), _) => Some(filter),
        (None, 0) => None,
        (None, 1) => Some("debug"),
        (None, _) => Some("trace"),
    };

    if let Some(filter) = explicit {
        return LoggingFilters {
            console: filter.to_string(),
            file: filter.to_string(),
        };
    }

    let base = options
        .rust_log_env
        .as_deref()
        .map(str::trim)
        .filter(|filter| !filter.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER);
    let console = format!("{DEFAULT_NOISE_FILTER},{base}");
    let file = with_file_debug_targets(&console);
    LoggingFilters { console, file }
}

fn with_file_debug_targets(filter: &str) -> String {
    let mentioned: Vec<&str> = filter
        .split(',')
        .filter_map(|directive| directive.split_once('='))
        .map(|(target, _)| target.trim())
        .collect();

    FILE_DEBUG_TARGETS
        .iter()
        .filter(|target| !mentioned.contains(target))
        .fold(filter.to_string(), |mut acc, target| {
            acc.push_str(&format!(",{target}=debug"));
            acc
        })
}

/// Mask URL userinfo and values of secret keys, and shorten inline base64
/// media to its length.
pub fn redact_sensitive_text(input: &str) -> String {
    let text = elide_data_uri_payloads(input);
    let text = redact_url_userinfo(&text);
    redact_secret_values(&text)
}

fn elide_data_uri_payloads(input: &str) -> String {
    const MARKER: &str = ";base64,";

    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(offset) = rest.find(MARKER) {
        let (head, tail) = rest.split_at(offset + MARKER.len());
        output.push_str(head);
        let payload_len = tail
            .find(|ch: char| !(ch.is_ascii_alphanumeric() || matches!(ch, '+' | '/' | '=')))
            .unwrap_or(tail.len());
        if payload_len > 0 {
            output.push_str(&format!("<{payload_len} bytes>"));
        }
        rest = &tail[payload_len..];
    }
    output.push_str(rest);
    output
}

fn redact_url_userinfo(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(offset) = rest.find("://") {
        let (head, tail) = rest.split_at(offset + 3);
        output.push_str(head);
        let authority_len = tail
            .find(|ch: char| {
                ch.is_whitespace() || matches!(ch, '/' | '?' | '#' | '"' | '\'' | '<' | '>')
            })
            .unwrap_or(tail.len());
        let authority = &tail[..authority_len];
        match authority.rfind('@') {
            Some(at) => {
                output.push_str(REDACTION_PLACEHOLDER);
                output.push_str(&authority[at..]);
            }
            None => output.push_str(authority),
        }
        rest = &tail[authority_len..];
    }
    output.push_str(rest);
    output
}

fn redact_secret_values(input: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with `input`.
    let lowered = input.to_ascii_lowercase();
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for key in SECRET_KEYS {
        let mut from = 0;
        while let Some(found) = lowered[from..].find(key) {
            from += found + key.len();
            spans.extend(secret_value_span(input, from));
        }
    }
    spans.sort_unstable();

    let mut output = String::with_capacity(input.len());
    let mut cursor = 0;
    for (start, end) in spans {
        if start < cursor {
            continue;
        }
        output.push_str(&input[cursor..start]);
        output.push_str(REDACTION_PLACEHOLDER);
        cursor = end;
    }
    output.push_str(&input[cursor..]);
    output
}

/// Byte range of the value assigned right after a key ending at `key_end`:
/// `key=value`, `key: Bearer value`, `"key": "value"`.
fn secret_value_span(input: &str, key_end: usize) -> Option<(usize, usize)> {
    let bytes = input.as_bytes();
    let mut index = key_end;
    if bytes.get(index) == Some(&b'"') {
        index += 1;
    }
    if !matches!(bytes.get(index), Some(b'=' | b':')) {
        return None;
    }
    index += 1;
    while bytes.get(index).is_some_and(u8::is_ascii_whitespace) {
        index += 1;
    }
    if input[index..]
        .get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("bearer "))
    {
        index += 7;
    }

    let end = match bytes.get(index) {
        Some(&quote @ (b'"' | b'\'')) => {
            index += 1;
            input[index..]
                .find(quote as char)
                .map_or(input.len(), |offset| index + offset)
        }
        _ => input[index..]
            .find(|ch: char| {
                ch.is_whitespace() || matches!(ch, ',' | ';' | '&' | '"' | '\'' | ')' | ']' | '}')
            })
            .map_or(input.len(), |offset| index + offset),
    };
    (end > index).then_some((index, end))
}
