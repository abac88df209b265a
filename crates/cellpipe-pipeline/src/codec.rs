//! The native pipeline text format.
//!
//! ```text
//! CellProfiler Pipeline: http://www.cellprofiler.org
//! Version:2
//! DateRevision:20261018
//!
//! LoadImages:[module_num:1|svn_version:\'Unknown\'|variable_revision_number:1|show_window:True|notes:\x5B\x5D|batch_state:array(\x5B\x5D, dtype=uint8)]
//!     Input image folder:/data/plate1
//!     Image file extension:png
//! ```
//!
//! Strings are backslash-escaped so that every line is printable ASCII, and
//! the structural delimiters `[`, `]`, `|`, `:` are always written as `\x`
//! escapes. Version 2 files additionally carry non-ASCII setting values as
//! `\uXXXX` UTF-16 escapes.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::events::{LoadExceptionEvent, PipelineEvent};
use crate::literal::{Literal, parse_literal};
use crate::module::{ModuleAttributes, PipelineModule};
use crate::pipeline::Pipeline;
use crate::types::{LoadError, PipelineError};

/// First line of every pipeline file; must match exactly.
pub const COOKIE: &str = "CellProfiler Pipeline: http://www.cellprofiler.org";

/// Highest format version this reader understands, and the one written.
pub const NATIVE_VERSION: u32 = 2;

/// Source revision marker written to the header.
pub const DATE_REVISION: u64 = 20_261_018;

const H_VERSION: &str = "Version";
const H_SVN_REVISION: &str = "SVNRevision";
const H_DATE_REVISION: &str = "DateRevision";
const H_FROM_MATLAB: &str = "FromMatlab";

const A_MODULE_NUM: &str = "module_num";
const A_SVN_VERSION: &str = "svn_version";
const A_VARIABLE_REVISION_NUMBER: &str = "variable_revision_number";
const A_SHOW_WINDOW: &str = "show_window";
const A_NOTES: &str = "notes";
const A_BATCH_STATE: &str = "batch_state";

/// Options for reading a pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Return the first module error instead of reporting it to listeners.
    pub raise_on_error: bool,
}

/// Escape a string for the text format.
///
/// Backslash, quote and non-printable bytes use backslash escapes; the
/// delimiters `:`, `|`, `[` and `]` become `\x3A`, `\x7C`, `\x5B`, `\x5D`.
#[must_use]
pub fn encode_txt(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for &b in text.as_bytes() {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b':' => out.push_str("\\x3A"),
            b'|' => out.push_str("\\x7C"),
            b'[' => out.push_str("\\x5B"),
            b']' => out.push_str("\\x5D"),
            0x20..0x7f => out.push(char::from(b)),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}

/// Reverse [`encode_txt`].
///
/// Unknown escapes are kept verbatim, including the backslash.
///
/// # Errors
///
/// Returns [`LoadError::BadEscape`] for a truncated or non-hex `\x`
/// escape or a trailing backslash, and [`LoadError::InvalidUtf8`] if the
/// decoded bytes are not UTF-8.
pub fn decode_txt(text: &str) -> Result<String, LoadError> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let Some(&e) = bytes.get(i) else {
            return Err(LoadError::BadEscape(text.to_string()));
        };
        i += 1;
        match e {
            b'\\' | b'\'' | b'"' => out.push(e),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\n' => {}
            b'x' => {
                let hex = bytes
                    .get(i..i + 2)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| LoadError::BadEscape(text.to_string()))?;
                out.push(hex);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = u32::from(e - b'0');
                let mut digits = 1;
                while digits < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                    value = value * 8 + u32::from(bytes[i] - b'0');
                    i += 1;
                    digits += 1;
                }
                out.push(u8::try_from(value & 0xff).unwrap_or(0));
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(String::from_utf8(out)?)
}

/// Encode a string as 7-bit ASCII: non-ASCII characters become `\uXXXX`
/// UTF-16 escapes and backslashes are doubled.
#[must_use]
pub fn utf16_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\\' {
            out.push_str("\\\\");
        } else if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

/// Reverse [`utf16_encode`]. Other backslash sequences are kept verbatim.
#[must_use]
pub fn utf16_decode(text: &str) -> String {
    let mut units: Vec<u16> = Vec::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u16; 2];
            units.extend_from_slice(c.encode_utf16(&mut buf));
            continue;
        }
        match chars.peek() {
            Some('\\') => {
                chars.next();
                units.push(u16::from(b'\\'));
            }
            Some('u') => {
                let hex: String = chars.clone().skip(1).take(4).collect();
                match u16::from_str_radix(&hex, 16) {
                    Ok(unit) if hex.len() == 4 => {
                        for _ in 0..5 {
                            chars.next();
                        }
                        units.push(unit);
                    }
                    _ => units.push(u16::from(b'\\')),
                }
            }
            _ => units.push(u16::from(b'\\')),
        }
    }
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Line reader that strips line endings and counts lines.
struct Lines<R> {
    reader: R,
    line: usize,
}

impl<R: BufRead> Lines<R> {
    const fn new(reader: R) -> Self {
        Self { reader, line: 0 }
    }

    fn next_line(&mut self) -> Result<Option<(usize, String)>, LoadError> {
        let mut buf = String::new();
        if self.reader.read_line(&mut buf)? == 0 {
            return Ok(None);
        }
        self.line += 1;
        let trimmed = buf.trim_end_matches(['\r', '\n']).len();
        buf.truncate(trimmed);
        Ok(Some((self.line, buf)))
    }
}

/// A module record as read from the file, before decoding.
struct RawModule {
    line: usize,
    header: String,
    settings: Vec<(usize, String)>,
}

impl Pipeline {
    /// Write the pipeline in the native text format.
    ///
    /// When `modules_to_save` is given, only those module numbers are
    /// written.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn savetxt<W: Write>(&self, mut writer: W, modules_to_save: Option<&[usize]>) -> io::Result<()> {
        writer.write_all(self.render_text(modules_to_save).as_bytes())?;
        writer.flush()
    }

    /// The whole pipeline in the native text format.
    #[must_use]
    pub fn to_text(&self) -> String {
        self.render_text(None)
    }

    /// Save to a file.
    ///
    /// # Errors
    ///
    /// Propagates file creation and write failures.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let file = File::create(path.as_ref())?;
        self.savetxt(BufWriter::new(file), None)?;
        info!(path = %path.as_ref().display(), modules = self.len(), "saved pipeline");
        Ok(())
    }

    /// Load from a file, replacing the current modules.
    ///
    /// # Errors
    ///
    /// See [`loadtxt`](Self::loadtxt).
    pub fn load(&mut self, path: impl AsRef<Path>, options: LoadOptions) -> Result<(), LoadError> {
        let file = File::open(path.as_ref())?;
        self.loadtxt(BufReader::new(file), options)
    }

    /// Load from text, replacing the current modules.
    ///
    /// # Errors
    ///
    /// See [`loadtxt`](Self::loadtxt).
    pub fn load_str(&mut self, text: &str, options: LoadOptions) -> Result<(), LoadError> {
        self.loadtxt(text.as_bytes(), options)
    }

    /// Read a pipeline in the native text format, replacing the current
    /// modules.
    ///
    /// A module record that fails to load is reported to listeners as a
    /// [`PipelineEvent::LoadException`] and skipped; the load stops early if
    /// a listener leaves `cancel_run` set. With
    /// [`LoadOptions::raise_on_error`] the first such error is returned
    /// instead. Header errors are always returned, and leave the pipeline
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::BadCookie`], [`LoadError::Truncated`],
    /// [`LoadError::UnsupportedVersion`], [`LoadError::MalformedHeader`],
    /// [`LoadError::Io`], or (with `raise_on_error`) any module error.
    pub fn loadtxt<R: BufRead>(&mut self, reader: R, options: LoadOptions) -> Result<(), LoadError> {
        let mut lines = Lines::new(reader);
        let version = read_header(&mut lines)?;
        let decode_utf16 = version > 1;

        let mut new_modules = Vec::new();
        while let Some(raw) = read_raw_module(&mut lines)? {
            let mut module_name = None;
            let mut settings = Vec::new();
            let module_num = new_modules.len() + 1;
            match self.decode_module(&raw, decode_utf16, module_num, &mut module_name, &mut settings) {
                Ok(module) => new_modules.push(module),
                Err(err) => {
                    if options.raise_on_error {
                        return Err(err);
                    }
                    error!(line = raw.line, module = module_name.as_deref().unwrap_or("?"), %err, "failed to load module");
                    let mut event = PipelineEvent::LoadException(LoadExceptionEvent::new(
                        &err,
                        module_name.as_deref(),
                        &settings,
                    ));
                    self.notify(&mut event);
                    if matches!(event, PipelineEvent::LoadException(ref e) if e.cancel_run) {
                        break;
                    }
                }
            }
        }

        info!(modules = new_modules.len(), version, "loaded pipeline");
        self.install_modules(new_modules);
        Ok(())
    }

    fn render_text(&self, modules_to_save: Option<&[usize]>) -> String {
        let mut out = String::new();
        out.push_str(COOKIE);
        out.push('\n');
        out.push_str(&format!("{H_VERSION}:{NATIVE_VERSION}\n"));
        out.push_str(&format!("{H_DATE_REVISION}:{DATE_REVISION}\n"));
        for pm in self.modules() {
            if modules_to_save.is_some_and(|keep| !keep.contains(&pm.module_num())) {
                continue;
            }
            out.push('\n');
            let attributes: Vec<String> = attribute_literals(pm)
                .into_iter()
                .map(|(name, value)| format!("{name}:{}", encode_txt(&value.to_string())))
                .collect();
            out.push_str(&format!(
                "{}:[{}]\n",
                encode_txt(pm.module_name()),
                attributes.join("|")
            ));
            for setting in pm.module().settings() {
                out.push_str(&format!(
                    "    {}:{}\n",
                    encode_txt(&setting.text),
                    encode_txt(&utf16_encode(&setting.value))
                ));
            }
        }
        out
    }

    fn decode_module(
        &self,
        raw: &RawModule,
        decode_utf16: bool,
        module_num: usize,
        module_name: &mut Option<String>,
        settings: &mut Vec<String>,
    ) -> Result<PipelineModule, LoadError> {
        let (name_part, attribute_part) =
            raw.header
                .split_once(':')
                .ok_or_else(|| LoadError::MalformedModuleHeader {
                    line: raw.line,
                    text: raw.header.clone(),
                })?;
        let name = decode_txt(name_part.trim())?;
        *module_name = Some(name.clone());

        for (line, text) in &raw.settings {
            let mut parts = text.split(':');
            let (Some(_label), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(LoadError::MalformedSetting {
                    line: *line,
                    text: text.clone(),
                });
            };
            let value = decode_txt(value)?;
            settings.push(if decode_utf16 { utf16_decode(&value) } else { value });
        }

        let (mut attributes, revision) = decode_attributes(raw.line, attribute_part)?;
        let revision = revision.ok_or_else(|| LoadError::MissingRevision {
            module_name: name.clone(),
        })?;

        let mut module = self
            .registry()
            .create(&name)
            .ok_or_else(|| LoadError::UnknownModule(name.clone()))?;
        module
            .set_settings_from_values(settings, revision)
            .map_err(|source| LoadError::Settings {
                module_name: name.clone(),
                source,
            })?;
        attributes.module_num = module_num;
        debug!(module = %name, module_num, revision, "decoded module");
        Ok(PipelineModule::with_attributes(module, attributes))
    }
}

fn read_header<R: BufRead>(lines: &mut Lines<R>) -> Result<u32, LoadError> {
    let cookie = lines.next_line()?.map(|(_, text)| text).unwrap_or_default();
    if cookie != COOKIE {
        return Err(LoadError::BadCookie(cookie));
    }
    let mut version = NATIVE_VERSION;
    loop {
        let (line, text) = lines.next_line()?.ok_or(LoadError::Truncated)?;
        if text.trim().is_empty() {
            return Ok(version);
        }
        let malformed = || LoadError::MalformedHeader {
            line,
            text: text.clone(),
        };
        let (key, value) = text.split_once(':').ok_or_else(malformed)?;
        match key {
            H_VERSION => {
                version = value.trim().parse().map_err(|_| malformed())?;
                if version > NATIVE_VERSION {
                    return Err(LoadError::UnsupportedVersion {
                        found: version,
                        supported: NATIVE_VERSION,
                    });
                }
            }
            H_SVN_REVISION | H_DATE_REVISION => {
                let revision: u64 = value.trim().parse().map_err(|_| malformed())?;
                if revision > DATE_REVISION {
                    warn!(
                        pipeline_revision = revision,
                        reader_revision = DATE_REVISION,
                        "pipeline was saved by a newer version; loading may fail or give unpredictable results"
                    );
                } else {
                    info!(pipeline_revision = revision, "pipeline revision");
                }
            }
            H_FROM_MATLAB => {
                debug!(from_matlab = value.trim(), "pipeline header");
            }
            other => warn!(key = other, "ignoring unknown pipeline header entry"),
        }
    }
}

fn read_raw_module<R: BufRead>(lines: &mut Lines<R>) -> Result<Option<RawModule>, LoadError> {
    let (line, header) = loop {
        match lines.next_line()? {
            None => return Ok(None),
            Some((_, text)) if text.trim().is_empty() => {}
            Some(found) => break found,
        }
    };
    let mut settings = Vec::new();
    while let Some((n, text)) = lines.next_line()? {
        if text.trim().is_empty() {
            break;
        }
        settings.push((n, text));
    }
    Ok(Some(RawModule {
        line,
        header,
        settings,
    }))
}

fn attribute_literals(pm: &PipelineModule) -> [(&'static str, Literal); 6] {
    let attributes = &pm.attributes;
    [
        (
            A_MODULE_NUM,
            Literal::Int(i64::try_from(pm.module_num()).unwrap_or(i64::MAX)),
        ),
        (A_SVN_VERSION, Literal::Str(attributes.svn_version.clone())),
        (
            A_VARIABLE_REVISION_NUMBER,
            Literal::Int(i64::from(pm.module().variable_revision_number())),
        ),
        (A_SHOW_WINDOW, Literal::Bool(attributes.show_window)),
        (A_NOTES, Literal::string_list(&attributes.notes)),
        (A_BATCH_STATE, Literal::byte_array(&attributes.batch_state)),
    ]
}

fn decode_attributes(line: usize, text: &str) -> Result<(ModuleAttributes, Option<u32>), LoadError> {
    let inner = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| LoadError::MalformedAttribute {
            line,
            text: text.to_string(),
        })?;
    let mut attributes = ModuleAttributes::default();
    let mut revision = None;
    for entry in inner.split('|').filter(|e| !e.is_empty()) {
        let mut parts = entry.split(':');
        let (Some(name), Some(raw), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(LoadError::MalformedAttribute {
                line,
                text: entry.to_string(),
            });
        };
        let value = parse_literal(&decode_txt(raw)?).map_err(|source| LoadError::Literal {
            line,
            name: name.to_string(),
            source,
        })?;
        let wrong_type = |expected| LoadError::AttributeType {
            line,
            name: name.to_string(),
            expected,
        };
        match name {
            A_MODULE_NUM | A_SVN_VERSION => {}
            A_VARIABLE_REVISION_NUMBER => {
                let n = value
                    .as_int()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| wrong_type("a non-negative integer"))?;
                revision = Some(n);
            }
            A_SHOW_WINDOW => {
                attributes.show_window = value.as_bool().ok_or_else(|| wrong_type("a boolean"))?;
            }
            A_NOTES => {
                attributes.notes = match &value {
                    Literal::Str(s) => vec![s.clone()],
                    other => other
                        .as_sequence()
                        .and_then(|items| {
                            items
                                .iter()
                                .map(|item| item.as_str().map(str::to_string))
                                .collect::<Option<Vec<_>>>()
                        })
                        .ok_or_else(|| wrong_type("a list of strings"))?,
                };
            }
            A_BATCH_STATE => {
                attributes.batch_state = value
                    .as_sequence()
                    .and_then(|items| {
                        items
                            .iter()
                            .map(|item| item.as_int().and_then(|v| u8::try_from(v).ok()))
                            .collect::<Option<Vec<_>>>()
                    })
                    .ok_or_else(|| wrong_type("a byte array"))?;
            }
            other => warn!(attribute = other, line, "ignoring unknown module attribute"),
        }
    }
    Ok((attributes, revision))
}
