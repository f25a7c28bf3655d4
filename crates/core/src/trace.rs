//! Call-site capture and stack trace resolution for failure diagnostics.

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::cell::RefCell;
use std::panic::Location;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock, Once};

/// Path segments kept for files outside the project root.
const FOREIGN_PATH_DEPTH: usize = 2;

const UNKNOWN: &str = "unknown";

/// Where a failure was raised, as recorded at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub file: Cow<'static, str>,
    pub function: Option<&'static str>,
    pub line: u32,
    pub column: u32,
}

impl CallSite {
    /// The location of the caller of the enclosing `#[track_caller]` function.
    #[track_caller]
    pub fn caller() -> Self {
        Self::from_location(Location::caller(), None)
    }

    pub fn from_location(location: &'static Location<'static>, function: Option<&'static str>) -> Self {
        Self {
            file: Cow::Borrowed(location.file()),
            function,
            line: location.line(),
            column: location.column(),
        }
    }

    /// Resolve against the project tree: display path plus source text.
    pub fn resolve(&self, sources: &SourceResolver) -> TraceFrame {
        TraceFrame {
            file: sources.display_path(&self.file),
            function: self.function.unwrap_or(UNKNOWN).to_string(),
            line: self.line,
            code: sources.source_line(&self.file, self.line),
        }
    }
}

impl std::fmt::Display for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)?;
        if let Some(function) = self.function {
            write!(f, " in {function}")?;
        }
        Ok(())
    }
}

/// One resolved stack frame, as reported in logs and `loc` bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceFrame {
    pub file: String,
    pub function: String,
    pub line: u32,
    pub code: Option<String>,
}

impl TraceFrame {
    pub fn unknown() -> Self {
        Self {
            file: UNKNOWN.to_string(),
            function: UNKNOWN.to_string(),
            line: 0,
            code: None,
        }
    }
}

/// Ordered frames, oldest call first, plus the frame where the failure
/// manifested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceInfo {
    pub origin: TraceFrame,
    pub full_trace: Vec<TraceFrame>,
}

/// Maps compile-time paths onto the project tree and reads source lines.
///
/// File contents are cached per path; a missing or unreadable file is cached
/// as absent.
#[derive(Debug)]
pub struct SourceResolver {
    project_root: Option<PathBuf>,
    lines: DashMap<PathBuf, Option<Arc<Vec<String>>>>,
}

impl SourceResolver {
    pub fn new(project_root: Option<PathBuf>) -> Self {
        Self {
            project_root,
            lines: DashMap::new(),
        }
    }

    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Path relative to the project root, or the last path segments when the
    /// file lives elsewhere.
    pub fn display_path(&self, file: &str) -> String {
        let path = Path::new(file);
        if path.is_relative() {
            return join_segments(path.components());
        }
        if let Some(relative) = self
            .project_root
            .as_deref()
            .and_then(|root| path.strip_prefix(root).ok())
        {
            return join_segments(relative.components());
        }
        let components: Vec<_> = path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        let start = components.len().saturating_sub(FOREIGN_PATH_DEPTH);
        join_segments(components[start..].iter().copied())
    }

    /// Whether `file` belongs to the project rather than the toolchain or a
    /// registry dependency.
    pub fn is_project_file(&self, file: &str) -> bool {
        let path = Path::new(file);
        if path.is_relative() {
            return true;
        }
        self.project_root
            .as_deref()
            .is_some_and(|root| path.starts_with(root) && !file.contains("/.cargo/"))
    }

    /// Trimmed source text of `line` (1-based), if the file can be read.
    pub fn source_line(&self, file: &str, line: u32) -> Option<String> {
        let path = self.absolute(file);
        let lines = match self.lines.get(&path) {
            Some(cached) => cached.clone(),
            None => {
                let loaded = std::fs::read_to_string(&path)
                    .ok()
                    .map(|text| Arc::new(text.lines().map(str::to_string).collect::<Vec<_>>()));
                self.lines.insert(path, loaded.clone());
                loaded
            }
        }?;
        let text = lines.get(usize::try_from(line).ok()?.checked_sub(1)?)?.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    fn absolute(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        match &self.project_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Resolve `site`, naming its function from `backtrace` when the site did
    /// not record one.
    pub fn locate(&self, site: &CallSite, backtrace: Option<&str>) -> TraceFrame {
        let raw = backtrace.map(parse_backtrace).unwrap_or_default();
        self.locate_in(site, &raw)
    }

    fn locate_in(&self, site: &CallSite, raw: &[RawFrame]) -> TraceFrame {
        let mut frame = site.resolve(self);
        if frame.function == UNKNOWN
            && let Some(symbol) = raw.iter().find(|f| f.matches(site))
        {
            frame.function = clean_function_name(&symbol.function).to_string();
        }
        frame
    }

    /// Resolve a captured backtrace into project frames ending at `origin`.
    pub fn trace_info(&self, backtrace: Option<&str>, origin: Option<&CallSite>) -> TraceInfo {
        let raw = backtrace.map(parse_backtrace).unwrap_or_default();

        let mut full_trace: Vec<TraceFrame> = raw
            .iter()
            .rev()
            .filter_map(|frame| {
                let file = frame.file.as_deref()?;
                let line = frame.line?;
                self.is_project_file(file).then(|| TraceFrame {
                    file: self.display_path(file),
                    function: clean_function_name(&frame.function).to_string(),
                    line,
                    code: self.source_line(file, line),
                })
            })
            .collect();

        if let Some(site) = origin {
            let frame = self.locate_in(site, &raw);
            let ends_at_origin = full_trace
                .last()
                .is_some_and(|last| last.file == frame.file && last.line == frame.line);
            if ends_at_origin {
                full_trace.pop();
            }
            full_trace.push(frame);
        }

        let origin = full_trace.last().cloned().unwrap_or_else(TraceFrame::unknown);
        TraceInfo { origin, full_trace }
    }
}

fn join_segments<'a>(components: impl Iterator<Item = Component<'a>>) -> String {
    components
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Last path segment of a symbol, with closure markers and hashes removed.
///
/// `omni_server::handler::items::show::{{closure}}` becomes `show`.
pub fn clean_function_name(symbol: &str) -> &str {
    static HASH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"::h[0-9a-f]{16}$").unwrap());

    let mut name = symbol;
    if let Some(found) = HASH.find(name) {
        name = &name[..found.start()];
    }
    loop {
        let trimmed = name
            .strip_suffix("::{{closure}}")
            .or_else(|| name.strip_suffix("::f"));
        match trimmed {
            Some(rest) => name = rest,
            None => break,
        }
    }
    name.rsplit("::").next().unwrap_or(name)
}

/// Name of the function enclosing the macro call site.
#[macro_export]
macro_rules! function_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        $crate::trace::clean_function_name(type_name_of(f))
    }};
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RawFrame {
    function: String,
    file: Option<String>,
    line: Option<u32>,
}

impl RawFrame {
    fn matches(&self, site: &CallSite) -> bool {
        self.line == Some(site.line)
            && self
                .file
                .as_deref()
                .is_some_and(|file| file.ends_with(&*site.file))
    }
}

/// Parse the `Display` rendering of a std backtrace, innermost frame first.
fn parse_backtrace(text: &str) -> Vec<RawFrame> {
    static SYMBOL: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*\d+:\s+(.+?)\s*$").unwrap());
    static AT: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*at\s+(.+):(\d+)(?::\d+)?\s*$").unwrap());

    let mut frames: Vec<RawFrame> = Vec::new();
    for line in text.lines() {
        if let Some(caps) = AT.captures(line) {
            if let Some(frame) = frames.last_mut().filter(|f| f.file.is_none()) {
                frame.file = Some(caps[1].to_string());
                frame.line = caps[2].parse().ok();
            }
        } else if let Some(caps) = SYMBOL.captures(line) {
            frames.push(RawFrame {
                function: caps[1].to_string(),
                file: None,
                line: None,
            });
        }
    }
    frames
}

/// Render a backtrace if one was actually captured.
pub fn captured(backtrace: &Backtrace) -> Option<String> {
    (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string())
}

// ─── Panics ────────────────────────────────────────────────────────────────

/// What the panic hook saw for the most recent panic inside a request.
#[derive(Debug, Clone)]
pub struct PanicCapture {
    pub message: String,
    pub location: Option<CallSite>,
    pub backtrace: Option<String>,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicCapture>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Install a panic hook that records panics raised inside a request scope so
/// the fallback translator can report them. The stack is always captured,
/// whatever `RUST_BACKTRACE` says. Panics outside a request go to the
/// previously installed hook. Idempotent.
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !crate::context::is_active() {
                previous(info);
                return;
            }
            let capture = PanicCapture {
                message: panic_message(info.payload()),
                location: info.location().map(|loc| CallSite {
                    file: Cow::Owned(loc.file().to_string()),
                    function: None,
                    line: loc.line(),
                    column: loc.column(),
                }),
                backtrace: captured(&Backtrace::force_capture()),
            };
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(capture));
        }));
    });
}

/// Take the capture recorded on this thread by the most recent panic.
pub fn take_panic_capture() -> Option<PanicCapture> {
    LAST_PANIC.with(|slot| slot.borrow_mut().take())
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}
