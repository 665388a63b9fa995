//! Structural editing for markdown note vaults.
//! The core stays pure: text goes in, a line-spanned document model, edited text, diffs and
//! link proposals come out. Everything touching disk sits behind `storage::NoteStore`.

pub mod core {
    use crate::storage::StoreError;
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};

    /* --------------------------- Document model --------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum ElementKind {
        Heading,
        Paragraph,
        ListBlock,
        CodeBlock,
    }

    impl ElementKind {
        pub fn as_str(self) -> &'static str {
            match self {
                ElementKind::Heading => "heading",
                ElementKind::Paragraph => "paragraph",
                ElementKind::ListBlock => "list",
                ElementKind::CodeBlock => "code",
            }
        }
    }

    /// A parsed unit of a document. Lines are zero-based; `start_line..=end_line` is inclusive.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct StructuralElement {
        pub kind: ElementKind,
        /// 1..=6, set for headings only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub level: Option<u8>,
        /// Heading title without markers or id suffix; raw joined lines for everything else.
        pub text: String,
        pub start_line: usize,
        pub end_line: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub block_id: Option<String>,
    }

    impl StructuralElement {
        pub fn new(kind: ElementKind, text: impl Into<String>, line: usize) -> Self {
            Self {
                kind,
                level: None,
                text: text.into(),
                start_line: line,
                end_line: line,
                block_id: None,
            }
        }

        pub fn heading(level: u8, text: impl Into<String>, line: usize, block_id: Option<String>) -> Self {
            Self {
                kind: ElementKind::Heading,
                level: Some(level),
                text: text.into(),
                start_line: line,
                end_line: line,
                block_id,
            }
        }

        pub fn is_heading(&self) -> bool {
            self.kind == ElementKind::Heading
        }

        pub fn contains_line(&self, line: usize) -> bool {
            (self.start_line..=self.end_line).contains(&line)
        }
    }

    /* --------------------------- Edit operations --------------------------- */

    /// Where inserted content lands relative to its target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Position {
        Before,
        #[default]
        After,
        Append,
        Prepend,
    }

    impl Position {
        pub fn as_str(self) -> &'static str {
            match self {
                Position::Before => "before",
                Position::After => "after",
                Position::Append => "append",
                Position::Prepend => "prepend",
            }
        }
    }

    impl FromStr for Position {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s {
                "before" => Ok(Position::Before),
                "after" => Ok(Position::After),
                "append" => Ok(Position::Append),
                "prepend" => Ok(Position::Prepend),
                other => Err(format!("unknown position {other:?}")),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum InsertTarget {
        Heading { name: String, level: Option<u8> },
        Block { id: String },
    }

    impl fmt::Display for InsertTarget {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                InsertTarget::Heading { name, level: Some(level) } => {
                    write!(f, "heading {name:?} (level {level})")
                }
                InsertTarget::Heading { name, level: None } => write!(f, "heading {name:?}"),
                InsertTarget::Block { id } => write!(f, "block ^{id}"),
            }
        }
    }

    /// A validated edit. Produced once from the wire shape, never re-inferred.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum EditOperation {
        Replace {
            old_text: String,
            new_text: String,
        },
        Insert {
            target: InsertTarget,
            content: String,
            position: Position,
        },
    }

    impl fmt::Display for EditOperation {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                EditOperation::Replace { old_text, .. } => {
                    write!(f, "replace {:?}", snippet(old_text))
                }
                EditOperation::Insert {
                    target, position, ..
                } => write!(f, "insert {} {target}", position.as_str()),
            }
        }
    }

    /// Wire shape of a single edit as supplied by callers.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct RawEdit {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub old_text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub new_text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub heading: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub block_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub position: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub level: Option<i64>,
    }

    impl RawEdit {
        pub fn replace(old_text: impl Into<String>, new_text: impl Into<String>) -> Self {
            Self {
                old_text: Some(old_text.into()),
                new_text: Some(new_text.into()),
                ..Self::default()
            }
        }

        pub fn insert_at_heading(
            heading: impl Into<String>,
            content: impl Into<String>,
            position: Position,
        ) -> Self {
            Self {
                mode: Some("insert".into()),
                heading: Some(heading.into()),
                content: Some(content.into()),
                position: Some(position.as_str().into()),
                ..Self::default()
            }
        }

        pub fn insert_at_block(
            block_id: impl Into<String>,
            content: impl Into<String>,
            position: Position,
        ) -> Self {
            Self {
                mode: Some("insert".into()),
                block_id: Some(block_id.into()),
                content: Some(content.into()),
                position: Some(position.as_str().into()),
                ..Self::default()
            }
        }

        /// Explicit mode wins; otherwise `replace` when both texts are present, else `insert`.
        pub fn effective_mode(&self) -> &str {
            match self.mode.as_deref() {
                Some(mode) => mode,
                None if present(&self.old_text) && present(&self.new_text) => "replace",
                None => "insert",
            }
        }

        fn target_label(&self) -> String {
            self.heading
                .clone()
                .filter(|h| !h.is_empty())
                .or_else(|| self.block_id.clone().filter(|b| !b.is_empty()))
                .unwrap_or_else(|| "unknown".to_string())
        }

        /// Validate and convert into a tagged operation. `operation` is the index within the batch.
        pub fn into_operation(self, operation: usize) -> Result<EditOperation, EditError> {
            let mode = self.effective_mode().to_string();
            let target_label = self.target_label();
            let mut problems: Vec<String> = Vec::new();

            let parsed = match mode.as_str() {
                "replace" => {
                    let old_text = non_empty(self.old_text);
                    let new_text = non_empty(self.new_text);
                    if old_text.is_none() {
                        problems.push("Replace mode requires oldText".into());
                    }
                    if new_text.is_none() {
                        problems.push("Replace mode requires newText".into());
                    }
                    match (old_text, new_text) {
                        (Some(old_text), Some(new_text)) => {
                            Some(EditOperation::Replace { old_text, new_text })
                        }
                        _ => None,
                    }
                }
                "insert" => {
                    let heading = non_empty(self.heading);
                    let block_id = non_empty(self.block_id);
                    let content = non_empty(self.content);

                    let target = match (heading, block_id) {
                        (None, None) => {
                            problems.push("Insert mode requires either heading or blockId".into());
                            None
                        }
                        (Some(_), Some(_)) => {
                            problems.push("Insert mode cannot have both heading and blockId".into());
                            None
                        }
                        (Some(name), None) => Some(InsertTarget::Heading { name, level: None }),
                        (None, Some(id)) => Some(InsertTarget::Block { id }),
                    };
                    if content.is_none() {
                        problems.push("Insert mode requires content".into());
                    }
                    let level = match self.level {
                        Some(level) if (1..=6).contains(&level) => Some(level as u8),
                        Some(_) => {
                            problems.push("Heading level must be between 1 and 6".into());
                            None
                        }
                        None => None,
                    };
                    let position = match self.position.as_deref() {
                        None => Position::default(),
                        Some(raw) => match raw.parse::<Position>() {
                            Ok(position) => position,
                            Err(_) => {
                                problems.push(
                                    "Position must be one of: before, after, append, prepend".into(),
                                );
                                Position::default()
                            }
                        },
                    };

                    match (target, content) {
                        (Some(mut target), Some(content)) => {
                            if let InsertTarget::Heading { level: slot, .. } = &mut target {
                                *slot = level;
                            }
                            Some(EditOperation::Insert {
                                target,
                                content,
                                position,
                            })
                        }
                        _ => None,
                    }
                }
                other => {
                    problems.push(format!("Unknown mode: {other}"));
                    None
                }
            };

            match parsed {
                Some(op) if problems.is_empty() => Ok(op),
                _ => Err(EditError::Validation {
                    operation,
                    target: target_label,
                    message: problems.join("; "),
                }),
            }
        }
    }

    fn present(value: &Option<String>) -> bool {
        value.as_deref().is_some_and(|v| !v.is_empty())
    }

    fn non_empty(value: Option<String>) -> Option<String> {
        value.filter(|v| !v.is_empty())
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum EditErrorKind {
        Validation,
        TargetNotFound,
        ReplaceNotFound,
        Io,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum EditError {
        #[error("edit #{operation} is invalid: {message} (target: {target})")]
        Validation {
            operation: usize,
            target: String,
            message: String,
        },
        #[error("edit #{operation} failed: {target} not found")]
        TargetNotFound {
            operation: usize,
            target: InsertTarget,
        },
        #[error("edit #{operation} failed: could not find matching text for {snippet:?}")]
        ReplaceNotFound { operation: usize, snippet: String },
        #[error(transparent)]
        Io(#[from] StoreError),
    }

    impl EditError {
        pub fn kind(&self) -> EditErrorKind {
            match self {
                EditError::Validation { .. } => EditErrorKind::Validation,
                EditError::TargetNotFound { .. } => EditErrorKind::TargetNotFound,
                EditError::ReplaceNotFound { .. } => EditErrorKind::ReplaceNotFound,
                EditError::Io(_) => EditErrorKind::Io,
            }
        }

        /// Index of the failing edit within its batch, when one edit is to blame.
        pub fn operation(&self) -> Option<usize> {
            match self {
                EditError::Validation { operation, .. }
                | EditError::TargetNotFound { operation, .. }
                | EditError::ReplaceNotFound { operation, .. } => Some(*operation),
                EditError::Io(_) => None,
            }
        }
    }

    /* ------------------------------- Text utils ------------------------------- */

    pub fn normalize_line_endings(text: &str) -> String {
        text.replace("\r\n", "\n").replace('\r', "\n")
    }

    /// First 50 characters, with an ellipsis when truncated.
    pub fn snippet(text: &str) -> String {
        let mut out: String = text.chars().take(50).collect();
        if text.chars().nth(50).is_some() {
            out.push_str("...");
        }
        out
    }

}

pub mod parser {
    //! Line-oriented markdown scanner producing the document model.
    //!
    //! Parsing strategy:
    //! - One forward pass over `\n`-separated lines; nothing is incremental.
    //! - Each line is classified with small `nom` recognisers (fence, heading, block id, list item).
    //! - An open element accumulates lines until a blank line, a heading, a fence or a kind change
    //!   closes it. Headings are always single-line elements.

    use crate::core::{ElementKind, StructuralElement};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while, take_while_m_n, take_while1},
        character::complete::{char, digit1, one_of, satisfy},
        combinator::{eof, map, recognize, rest, verify},
        error::VerboseError,
        sequence::{delimited, terminated, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse newline-normalised text into elements ordered by `start_line`.
    pub fn parse_document(text: &str) -> Vec<StructuralElement> {
        if text.is_empty() {
            return Vec::new();
        }
        let mut scanner = Scanner::default();
        for (idx, line) in text.split('\n').enumerate() {
            scanner.line(idx, line);
        }
        scanner.finish()
    }

    /* ------------------------------ Scanner ------------------------------ */

    #[derive(Default)]
    struct Scanner {
        elements: Vec<StructuralElement>,
        open: Option<StructuralElement>,
        /// Marker of the fenced block currently open (```` ``` ```` or `~~~`).
        fence: Option<&'static str>,
    }

    impl Scanner {
        fn line(&mut self, idx: usize, line: &str) {
            let trimmed = line.trim();

            if let Some(marker) = self.fence {
                self.extend_open(idx, line);
                if trimmed.starts_with(marker) {
                    self.fence = None;
                    self.close_open();
                }
                return;
            }

            if let Ok((_, marker)) = fence_open(trimmed) {
                self.close_open();
                self.fence = Some(if marker == "```" { "```" } else { "~~~" });
                self.open = Some(StructuralElement::new(ElementKind::CodeBlock, line, idx));
                return;
            }

            if let Ok((_, (level, title))) = heading_line(line) {
                self.close_open();
                let title = title.trim();
                let element = match block_id_suffix(title, false) {
                    Some((text, id)) => {
                        StructuralElement::heading(level, text, idx, Some(id.to_string()))
                    }
                    None => StructuralElement::heading(level, title, idx, None),
                };
                self.elements.push(element);
                return;
            }

            if let Ok((_, id)) = block_id_line(line) {
                if self.attach_block_id(idx, line, id) {
                    return;
                }
            }

            if trimmed.is_empty() {
                self.close_open();
                return;
            }

            let is_list_item = list_item_line(line).is_ok();
            match self.open.as_ref().map(|e| e.kind) {
                // Lazy continuation: non-blank lines after an item stay in the list.
                Some(ElementKind::ListBlock) => self.extend_open(idx, line),
                Some(ElementKind::Paragraph) if !is_list_item => self.extend_open(idx, line),
                _ => {
                    self.close_open();
                    let kind = if is_list_item {
                        ElementKind::ListBlock
                    } else {
                        ElementKind::Paragraph
                    };
                    self.open = Some(StructuralElement::new(kind, line, idx));
                }
            }

            if let Some((_, id)) = block_id_suffix(line.trim_end(), true) {
                if let Some(open) = self.open.as_mut() {
                    if open.block_id.is_none() {
                        open.block_id = Some(id.to_string());
                    }
                }
            }
        }

        fn extend_open(&mut self, idx: usize, line: &str) {
            if let Some(open) = self.open.as_mut() {
                open.text.push('\n');
                open.text.push_str(line);
                open.end_line = idx;
            }
        }

        fn close_open(&mut self) {
            if let Some(done) = self.open.take() {
                self.elements.push(done);
            }
        }

        /// A standalone `^id` line names the paragraph right above it. Returns false when there
        /// is nothing to attach to, in which case the line is ordinary text.
        fn attach_block_id(&mut self, idx: usize, line: &str, id: &str) -> bool {
            let open = self.open.as_ref().map(|e| (e.kind, e.block_id.is_none()));
            match open {
                Some((ElementKind::Paragraph, true)) => {
                    if let Some(paragraph) = self.open.as_mut() {
                        paragraph.block_id = Some(id.to_string());
                        paragraph.end_line = idx;
                    }
                    self.close_open();
                    true
                }
                Some(_) => {
                    self.extend_open(idx, line);
                    true
                }
                None => match self.elements.last_mut() {
                    Some(last) if last.kind == ElementKind::Paragraph && last.block_id.is_none() => {
                        last.block_id = Some(id.to_string());
                        last.end_line = idx;
                        true
                    }
                    _ => false,
                },
            }
        }

        fn finish(mut self) -> Vec<StructuralElement> {
            self.close_open();
            self.elements
        }
    }

    /* --------------------------- Line recognisers --------------------------- */

    fn is_block_id_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '-' || c == '_'
    }

    fn fence_open(trimmed: &str) -> PResult<'_, &str> {
        alt((tag("```"), tag("~~~")))(trimmed)
    }

    /// `#{1,6}` followed by whitespace and at least one more character.
    fn heading_line(line: &str) -> PResult<'_, (u8, &str)> {
        map(
            tuple((
                take_while_m_n(1, 6, |c: char| c == '#'),
                satisfy(char::is_whitespace),
                verify(rest, |s: &str| !s.is_empty()),
            )),
            |(hashes, _, title): (&str, char, &str)| (hashes.len() as u8, title),
        )(line)
    }

    /// `^id` alone on a line, surrounding whitespace allowed.
    fn block_id_line(line: &str) -> PResult<'_, &str> {
        delimited(
            tuple((take_while(char::is_whitespace), char('^'))),
            take_while1(is_block_id_char),
            terminated(take_while(char::is_whitespace), eof),
        )(line)
    }

    /// Bullet (`-`, `*`, `+`) or ordinal (`12.`) marker, whitespace, then content.
    fn list_item_line(line: &str) -> PResult<'_, &str> {
        recognize(tuple((
            take_while(char::is_whitespace),
            alt((
                recognize(one_of("-*+")),
                recognize(terminated(digit1, char('.'))),
            )),
            satisfy(char::is_whitespace),
            verify(rest, |s: &str| !s.is_empty()),
        )))(line)
    }

    /// Split a trailing `^id` off `text`. With `require_space` the caret must follow whitespace.
    fn block_id_suffix(text: &str, require_space: bool) -> Option<(&str, &str)> {
        let caret = text.rfind('^')?;
        let id = &text[caret + 1..];
        if id.is_empty() || !id.chars().all(is_block_id_char) {
            return None;
        }
        let head = &text[..caret];
        if require_space && !head.ends_with(char::is_whitespace) {
            return None;
        }
        let head = head.trim_end();
        if head.is_empty() {
            return None;
        }
        Some((head, id))
    }

}

pub mod locate {
    //! Target resolution and insertion-line arithmetic over a parsed document.
    //!
    //! Heading lookup is tiered (exact, substring, normalised substring); the first tier with a
    //! hit wins, and within a tier the earliest heading wins.

    use crate::core::{InsertTarget, Position, StructuralElement};

    /// Index of the heading best matching `name`, optionally restricted to one level.
    pub fn find_heading(
        elements: &[StructuralElement],
        name: &str,
        level: Option<u8>,
    ) -> Option<usize> {
        let wanted = name.trim().to_lowercase();
        let candidates = || {
            elements
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_heading())
                .filter(move |(_, e)| level.is_none() || e.level == level)
        };

        if let Some((idx, _)) =
            candidates().find(|(_, e)| e.text.trim().to_lowercase() == wanted)
        {
            return Some(idx);
        }
        if let Some((idx, _)) = candidates().find(|(_, e)| e.text.to_lowercase().contains(&wanted)) {
            return Some(idx);
        }
        let wanted = normalize_heading(&wanted);
        candidates()
            .find(|(_, e)| normalize_heading(&e.text).contains(&wanted))
            .map(|(idx, _)| idx)
    }

    /// Index of the element carrying exactly this block id.
    pub fn find_block(elements: &[StructuralElement], id: &str) -> Option<usize> {
        elements
            .iter()
            .position(|e| e.block_id.as_deref() == Some(id))
    }

    pub fn resolve(elements: &[StructuralElement], target: &InsertTarget) -> Option<usize> {
        match target {
            InsertTarget::Heading { name, level } => find_heading(elements, name, *level),
            InsertTarget::Block { id } => find_block(elements, id),
        }
    }

    /// Absolute line at which content is spliced for `position` relative to `elements[index]`.
    ///
    /// `Append` and `Prepend` are section-aware for headings only; for any other element
    /// `Append` behaves like `After` and `Prepend` like `Before`.
    pub fn insertion_line(elements: &[StructuralElement], index: usize, position: Position) -> usize {
        let target = &elements[index];
        match position {
            Position::Before => target.start_line,
            Position::After => target.end_line + 1,
            Position::Prepend if target.is_heading() => target.end_line + 1,
            Position::Prepend => target.start_line,
            Position::Append if target.is_heading() => section_end(elements, index),
            Position::Append => target.end_line + 1,
        }
    }

    /// Start of the next heading at the same or a shallower level, else one past the last element.
    pub fn section_end(elements: &[StructuralElement], index: usize) -> usize {
        let heading = &elements[index];
        let Some(level) = heading.level.filter(|_| heading.is_heading()) else {
            return heading.end_line + 1;
        };
        elements[index + 1..]
            .iter()
            .find(|e| e.is_heading() && e.level.is_some_and(|l| l <= level))
            .map(|e| e.start_line)
            .unwrap_or_else(|| elements.last().map_or(0, |last| last.end_line + 1))
    }

    /// Lowercase, drop everything but letters, digits, `_` and whitespace, collapse whitespace.
    fn normalize_heading(text: &str) -> String {
        let kept: String = text
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
            .collect();
        kept.split_whitespace().collect::<Vec<_>>().join(" ")
    }

}

pub mod apply {
    //! Ordered, all-or-nothing edit batches over an in-memory line buffer.
    //!
    //! A session moves `Idle -> Validating -> Mutating -> Succeeded | Failed`. Every raw edit
    //! is validated before the first mutation; each successful step re-parses the buffer so the
    //! next step sees fresh line numbers. A failure rolls the buffer back to the original text.

    use crate::core::*;
    use crate::diff::unified_diff;
    use crate::locate;
    use crate::parser::parse_document;
    use crate::storage::NoteStore;
    use log::{debug, info};
    use serde::{Deserialize, Serialize};
    use std::fmt;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Phase {
        Idle,
        Validating,
        Mutating,
        Succeeded,
        Failed,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum StepOutcome {
        Applied,
        /// `Replace` whose old and new text are identical.
        Skipped,
    }

    /// Edit buffer for a single document.
    #[derive(Debug, Clone)]
    pub struct EditSession {
        original: String,
        text: String,
        elements: Vec<StructuralElement>,
        phase: Phase,
        applied: usize,
        skipped: usize,
    }

    impl EditSession {
        pub fn new(text: &str) -> Self {
            let text = normalize_line_endings(text);
            Self {
                elements: parse_document(&text),
                original: text.clone(),
                text,
                phase: Phase::Idle,
                applied: 0,
                skipped: 0,
            }
        }

        pub fn phase(&self) -> Phase {
            self.phase
        }

        /// Normalised text as it was before any edit.
        pub fn original(&self) -> &str {
            &self.original
        }

        pub fn text(&self) -> &str {
            &self.text
        }

        pub fn elements(&self) -> &[StructuralElement] {
            &self.elements
        }

        pub fn applied(&self) -> usize {
            self.applied
        }

        pub fn skipped(&self) -> usize {
            self.skipped
        }

        pub fn is_modified(&self) -> bool {
            self.text != self.original
        }

        /// Validate every raw edit, then apply them in order.
        pub fn run(&mut self, edits: Vec<RawEdit>) -> Result<(), EditError> {
            self.transition(Phase::Validating);
            let ops = match edits
                .into_iter()
                .enumerate()
                .map(|(idx, raw)| raw.into_operation(idx))
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(ops) => ops,
                Err(err) => return Err(self.fail(err)),
            };
            self.apply_operations(&ops)
        }

        /// Apply already-validated operations in order; the first failure aborts the batch.
        pub fn apply_operations(&mut self, ops: &[EditOperation]) -> Result<(), EditError> {
            self.transition(Phase::Mutating);
            for (idx, op) in ops.iter().enumerate() {
                match self.step(idx, op) {
                    Ok(StepOutcome::Applied) => self.applied += 1,
                    Ok(StepOutcome::Skipped) => self.skipped += 1,
                    Err(err) => return Err(self.fail(err)),
                }
            }
            self.transition(Phase::Succeeded);
            Ok(())
        }

        fn transition(&mut self, next: Phase) {
            debug!("edit session {:?} -> {:?}", self.phase, next);
            self.phase = next;
        }

        fn fail(&mut self, err: EditError) -> EditError {
            debug!("edit batch aborted: {err}");
            self.text = self.original.clone();
            self.elements = parse_document(&self.text);
            self.applied = 0;
            self.skipped = 0;
            self.transition(Phase::Failed);
            err
        }

        fn step(&mut self, operation: usize, op: &EditOperation) -> Result<StepOutcome, EditError> {
            debug!("edit #{operation}: {op}");
            let outcome = match op {
                EditOperation::Replace { old_text, new_text } => {
                    self.replace(operation, old_text, new_text)?
                }
                EditOperation::Insert {
                    target,
                    content,
                    position,
                } => self.insert(operation, target, content, *position)?,
            };
            if outcome == StepOutcome::Applied {
                self.elements = parse_document(&self.text);
            }
            Ok(outcome)
        }

        fn replace(
            &mut self,
            operation: usize,
            old_text: &str,
            new_text: &str,
        ) -> Result<StepOutcome, EditError> {
            if old_text == new_text {
                return Ok(StepOutcome::Skipped);
            }

            if let Some(at) = self.text.find(old_text) {
                self.text.replace_range(at..at + old_text.len(), new_text);
                return Ok(StepOutcome::Applied);
            }

            let lines: Vec<&str> = self.text.split('\n').collect();
            let old_lines: Vec<&str> = old_text.split('\n').collect();
            let Some(start) = find_line_window(&lines, &old_lines) else {
                return Err(EditError::ReplaceNotFound {
                    operation,
                    snippet: snippet(old_text),
                });
            };
            debug!("edit #{operation}: whitespace-insensitive match at line {start}");

            let replacement: Vec<String> = new_text
                .split('\n')
                .enumerate()
                .map(|(idx, line)| match old_lines.get(idx).and(lines.get(start + idx)) {
                    Some(matched) => format!("{}{}", leading_whitespace(matched), line.trim_start()),
                    None => line.to_string(),
                })
                .collect();

            let mut rebuilt: Vec<&str> = Vec::with_capacity(lines.len() + replacement.len());
            rebuilt.extend_from_slice(&lines[..start]);
            rebuilt.extend(replacement.iter().map(String::as_str));
            rebuilt.extend_from_slice(&lines[start + old_lines.len()..]);
            self.text = rebuilt.join("\n");
            Ok(StepOutcome::Applied)
        }

        fn insert(
            &mut self,
            operation: usize,
            target: &InsertTarget,
            content: &str,
            position: Position,
        ) -> Result<StepOutcome, EditError> {
            let index = locate::resolve(&self.elements, target).ok_or_else(|| {
                EditError::TargetNotFound {
                    operation,
                    target: target.clone(),
                }
            })?;
            let line = locate::insertion_line(&self.elements, index, position);

            let mut lines: Vec<&str> = self.text.split('\n').collect();
            let at = line.min(lines.len());
            lines.splice(at..at, content.split('\n'));
            self.text = lines.join("\n");
            Ok(StepOutcome::Applied)
        }
    }

    /// First window of `buffer` whose lines equal `wanted` ignoring surrounding whitespace.
    fn find_line_window(buffer: &[&str], wanted: &[&str]) -> Option<usize> {
        if wanted.is_empty() || wanted.len() > buffer.len() {
            return None;
        }
        (0..=buffer.len() - wanted.len()).find(|&start| {
            wanted
                .iter()
                .zip(&buffer[start..])
                .all(|(want, have)| want.trim() == have.trim())
        })
    }

    fn leading_whitespace(line: &str) -> &str {
        &line[..line.len() - line.trim_start().len()]
    }

    /// Apply `edits` to `text` without touching any store.
    pub fn apply_edits(text: &str, edits: Vec<RawEdit>) -> Result<EditSession, EditError> {
        let mut session = EditSession::new(text);
        session.run(edits)?;
        Ok(session)
    }

    /* ----------------------------- Batch call ----------------------------- */

    /// One edit batch against a stored document.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EditRequest {
        pub path: String,
        pub edits: Vec<RawEdit>,
        #[serde(default)]
        pub dry_run: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum EditOutcome {
        /// Unified diff of what the batch would change.
        Preview(String),
        Written {
            path: String,
            applied: usize,
            skipped: usize,
        },
    }

    impl fmt::Display for EditOutcome {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                EditOutcome::Preview(diff) => f.write_str(diff),
                EditOutcome::Written { path, .. } => write!(f, "File {path} updated successfully"),
            }
        }
    }

    impl EditRequest {
        pub fn new(path: impl Into<String>, edits: Vec<RawEdit>, dry_run: bool) -> Self {
            Self {
                path: path.into(),
                edits,
                dry_run,
            }
        }

        /// Read, edit in memory, then either diff or persist once.
        pub fn execute<S: NoteStore + ?Sized>(self, store: &S) -> Result<EditOutcome, EditError> {
            let EditRequest {
                path,
                edits,
                dry_run,
            } = self;
            let text = store.read(&path)?;
            let mut session = EditSession::new(&text);
            session.run(edits)?;

            if dry_run {
                return Ok(EditOutcome::Preview(unified_diff(
                    session.original(),
                    session.text(),
                    &path,
                )));
            }

            store.write(&path, session.text())?;
            info!(
                "updated {path}: {} edit(s) applied, {} skipped",
                session.applied(),
                session.skipped()
            );
            Ok(EditOutcome::Written {
                path,
                applied: session.applied(),
                skipped: session.skipped(),
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::storage::MemoryStore;

        fn apply(text: &str, edits: Vec<RawEdit>) -> Result<String, EditError> {
            apply_edits(text, edits).map(|s| s.text().to_string())
        }

        #[test]
        fn append_lands_before_next_sibling_heading() {
            let doc = "# A\none\ntwo\n# B\nthree";
            let out = apply(doc, vec![RawEdit::insert_at_heading("A", "X", Position::Append)])
                .expect("insert");
            let lines: Vec<&str> = out.split('\n').collect();
            assert_eq!(lines, vec!["# A", "one", "two", "X", "# B", "three"]);
        }

        #[test]
        fn after_lands_directly_below_heading() {
            let out = apply(
                "# A\none\n# B",
                vec![RawEdit::insert_at_heading("a", "X\nY", Position::After)],
            )
            .expect("insert");
            assert_eq!(out, "# A\nX\nY\none\n# B");
        }

        #[test]
        fn insert_relative_to_block_id() {
            let doc = "intro\n\nclaim text\n^c1\n\noutro";
            let out = apply(
                doc,
                vec![
                    RawEdit::insert_at_block("c1", "> quote", Position::Before),
                    RawEdit::insert_at_block("c1", "after", Position::Append),
                ],
            )
            .expect("insert");
            assert_eq!(out, "intro\n\n> quote\nclaim text\n^c1\nafter\n\noutro");
        }

        #[test]
        fn later_edits_see_post_mutation_lines() {
            let doc = "# A\nbody\n# B\nbody b";
            let out = apply(
                doc,
                vec![
                    RawEdit::insert_at_heading("A", "new line 1\nnew line 2", Position::Append),
                    RawEdit::insert_at_heading("B", "under b", Position::After),
                ],
            )
            .expect("insert");
            assert_eq!(
                out,
                "# A\nbody\nnew line 1\nnew line 2\n# B\nunder b\nbody b"
            );
        }

        #[test]
        fn exact_replace_changes_first_occurrence_only() {
            let out = apply("cat cat", vec![RawEdit::replace("cat", "dog")]).expect("replace");
            assert_eq!(out, "dog cat");
        }

        #[test]
        fn line_window_replace_borrows_indentation_from_matched_lines() {
            let doc = "fn main() {\n    let a = 1;\n        let b = 2;\n}";
            let out = apply(
                doc,
                vec![RawEdit::replace(
                    "let a = 1;\nlet b = 2;",
                    "let a = 10;\nlet b = 20;\nlet c = 30;",
                )],
            )
            .expect("replace");
            assert_eq!(
                out,
                "fn main() {\n    let a = 10;\n        let b = 20;\nlet c = 30;\n}"
            );
        }

        #[test]
        fn identical_replace_is_skipped() {
            let session = apply_edits("same", vec![RawEdit::replace("missing", "missing")])
                .expect("noop");
            assert_eq!(session.skipped(), 1);
            assert_eq!(session.text(), "same");
            assert!(!session.is_modified());
        }

        #[test]
        fn replace_round_trip_restores_original() {
            let doc = "# Title\n\nalpha paragraph\n\n- beta item\n";
            let out = apply(
                doc,
                vec![
                    RawEdit::replace("alpha", "gamma"),
                    RawEdit::replace("gamma", "alpha"),
                ],
            )
            .expect("round trip");
            assert_eq!(out, doc);
        }

        #[test]
        fn failure_aborts_whole_batch_and_rolls_back() {
            let mut session = EditSession::new("# A\nbody");
            let err = session
                .run(vec![
                    RawEdit::insert_at_heading("A", "added", Position::After),
                    RawEdit::replace("nowhere", "x"),
                ])
                .expect_err("second edit fails");
            assert_eq!(err.kind(), EditErrorKind::ReplaceNotFound);
            assert_eq!(err.operation(), Some(1));
            assert_eq!(session.phase(), Phase::Failed);
            assert_eq!(session.text(), "# A\nbody");
        }

        #[test]
        fn validation_runs_before_any_mutation() {
            let mut session = EditSession::new("# A");
            let err = session
                .run(vec![
                    RawEdit::insert_at_heading("A", "added", Position::After),
                    RawEdit {
                        mode: Some("insert".into()),
                        ..RawEdit::default()
                    },
                ])
                .expect_err("invalid");
            assert_eq!(err.kind(), EditErrorKind::Validation);
            assert_eq!(session.phase(), Phase::Failed);
            assert_eq!(session.applied(), 0);
        }

        #[test]
        fn missing_heading_reports_target() {
            let err = apply("# A", vec![RawEdit::insert_at_heading("Zed", "x", Position::After)])
                .expect_err("missing");
            assert_eq!(err.kind(), EditErrorKind::TargetNotFound);
            assert!(err.to_string().contains("heading \"Zed\""));
        }

        #[test]
        fn successful_batches_keep_structural_coverage() {
            let doc = "# Log\n\n- one\n\n```\ncode\n```\n\n## Notes\ntext ^n1\n";
            let session = apply_edits(
                doc,
                vec![
                    RawEdit::insert_at_heading("Log", "para\n\n- two", Position::Prepend),
                    RawEdit::insert_at_block("n1", "```\nmore\n```", Position::After),
                    RawEdit::replace("code", "# not a heading"),
                ],
            )
            .expect("batch");
            crate::parser::tests::assert_covers_non_blank_lines(session.text());
        }

        #[test]
        fn dry_run_returns_diff_and_leaves_store_untouched() {
            let store = MemoryStore::with_notes([("notes/a.md", "# A\r\nbody\r\n")]);
            let outcome = EditRequest::new(
                "notes/a.md",
                vec![RawEdit::replace("body", "changed")],
                true,
            )
            .execute(&store)
            .expect("preview");
            match outcome {
                EditOutcome::Preview(diff) => {
                    assert!(diff.contains("--- notes/a.md"));
                    assert!(diff.contains("-body"));
                    assert!(diff.contains("+changed"));
                }
                other => panic!("expected preview, got {other:?}"),
            }
            assert_eq!(store.write_count(), 0);
            assert_eq!(store.get("notes/a.md").as_deref(), Some("# A\r\nbody\r\n"));
        }

        #[test]
        fn persisted_batch_writes_once() {
            let store = MemoryStore::with_notes([("a.md", "# A\nbody\n")]);
            let outcome = EditRequest::new(
                "a.md",
                vec![
                    RawEdit::insert_at_heading("A", "first", Position::After),
                    RawEdit::replace("body", "changed"),
                ],
                false,
            )
            .execute(&store)
            .expect("write");
            assert_eq!(outcome.to_string(), "File a.md updated successfully");
            assert_eq!(store.write_count(), 1);
            assert_eq!(store.get("a.md").as_deref(), Some("# A\nfirst\nchanged\n"));
        }

        #[test]
        fn failed_batch_never_writes() {
            let store = MemoryStore::with_notes([("a.md", "# A\n")]);
            let err = EditRequest::new(
                "a.md",
                vec![
                    RawEdit::insert_at_heading("A", "x", Position::After),
                    RawEdit::insert_at_block("nope", "y", Position::After),
                ],
                false,
            )
            .execute(&store)
            .expect_err("missing block");
            assert_eq!(err.kind(), EditErrorKind::TargetNotFound);
            assert_eq!(store.write_count(), 0);
        }

        #[test]
        fn missing_document_is_an_io_error() {
            let store = MemoryStore::new();
            let err = EditRequest::new("nope.md", vec![RawEdit::replace("a", "b")], false)
                .execute(&store)
                .expect_err("missing");
            assert_eq!(err.kind(), EditErrorKind::Io);
        }
    }
}

pub mod diff {
    use diffy::{DiffOptions, Line, Patch};

    const CONTEXT_LINES: usize = 4;
    const SEPARATOR: &str =
        "===================================================================";

    /// Unified diff of `original` against `modified`, both sides labelled `path`.
    pub fn unified_diff(original: &str, modified: &str, path: &str) -> String {
        let mut options = DiffOptions::new();
        options.set_context_len(CONTEXT_LINES);
        let patch = options.create_patch(original, modified);
        render(path, &patch)
    }

    fn render(path: &str, patch: &Patch<'_, str>) -> String {
        let mut out = vec![
            format!("Index: {path}"),
            SEPARATOR.to_string(),
            format!("--- {path}\toriginal"),
            format!("+++ {path}\tmodified"),
        ];

        for hunk in patch.hunks() {
            out.push(format!(
                "@@ -{},{} +{},{} @@",
                hunk.old_range().start(),
                hunk.old_range().len(),
                hunk.new_range().start(),
                hunk.new_range().len()
            ));
            for line in hunk.lines() {
                let (prefix, value) = match line {
                    Line::Context(value) => (' ', value),
                    Line::Delete(value) => ('-', value),
                    Line::Insert(value) => ('+', value),
                };
                match value.strip_suffix('\n') {
                    Some(content) => out.push(format!("{prefix}{content}")),
                    None => {
                        out.push(format!("{prefix}{value}"));
                        out.push("\\ No newline at end of file".to_string());
                    }
                }
            }
        }

        let mut rendered = out.join("\n");
        rendered.push('\n');
        rendered
    }

}

pub mod backlink {
    //! Turns plain mentions of other documents' names into `[[wikilinks]]`.

    use crate::core::normalize_line_endings;
    use crate::storage::{NoteStore, StoreError};
    use indexmap::IndexMap;
    use log::{debug, info, warn};
    use once_cell::sync::Lazy;
    use regex::{Regex, RegexBuilder};
    use serde::{Deserialize, Serialize};
    use std::{fmt, ops::Range, path::Path, thread, time::Duration};

    const STOP_WORDS: &[&str] = &[
        "the", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "from", "up",
        "about", "into", "over", "after",
    ];

    pub const MIN_LENGTH_RANGE: (usize, usize) = (1, 100);
    pub const BATCH_SIZE_RANGE: (usize, usize) = (1, 500);
    const BATCH_PAUSE: Duration = Duration::from_millis(10);
    const PREVIEW_LIMIT: usize = 10;

    static SKIP_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
        [
            r"(?s)```.*?```",
            r"(?s)~~~.*?~~~",
            r"`[^`]*`",
            r"\[\[[^\]]*\]\]",
            r"\[[^\]]*\]\([^)]*\)",
            r"https?://\S*",
            r"!\[\[[^\]]*\]\]",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("invalid skip pattern"))
        .collect()
    });

    #[derive(Debug, thiserror::Error)]
    pub enum BacklinkError {
        #[error("{0}")]
        InvalidOption(String),
        #[error("invalid exclude pattern {pattern:?}: {source}")]
        InvalidExcludePattern {
            pattern: String,
            #[source]
            source: regex::Error,
        },
        #[error("could not build pattern for {name:?}: {source}")]
        Pattern {
            name: String,
            #[source]
            source: regex::Error,
        },
        #[error(transparent)]
        Store(#[from] StoreError),
    }

    /* ------------------------------ Matching ------------------------------ */

    /// A document that other documents may link to.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BacklinkCandidate {
        pub document_name: String,
        pub source_path: String,
    }

    /// Markdown documents from `paths`, longest name first.
    pub fn build_corpus<S: AsRef<str>>(paths: &[S]) -> Vec<BacklinkCandidate> {
        let mut corpus = Vec::new();
        for path in paths {
            let path: &str = path.as_ref();
            let file = Path::new(path);
            if !file.extension().is_some_and(|ext| ext == "md") {
                continue;
            }
            if let Some(stem) = file.file_stem().and_then(|s| s.to_str()) {
                corpus.push(BacklinkCandidate {
                    document_name: stem.to_string(),
                    source_path: path.to_string(),
                });
            }
        }
        corpus.sort_by(|a, b| b.document_name.len().cmp(&a.document_name.len()));
        corpus
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MatchOptions {
        pub min_length: usize,
        pub case_sensitive: bool,
        pub whole_words: bool,
    }

    impl Default for MatchOptions {
        fn default() -> Self {
            Self {
                min_length: 3,
                case_sensitive: false,
                whole_words: true,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BacklinkMatch {
        pub old_text: String,
        pub new_text: String,
        pub source_document_path: String,
        /// Byte offset of the link in the rewritten text.
        pub offset: usize,
    }

    /// Accepted matches plus the text with every one of them applied.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BacklinkScan {
        pub matches: Vec<BacklinkMatch>,
        pub text: String,
    }

    /// Byte ranges of `text` that must never be rewritten, sorted by start.
    pub fn skip_regions(text: &str) -> Vec<Range<usize>> {
        let mut regions: Vec<Range<usize>> = SKIP_PATTERNS
            .iter()
            .flat_map(|re| re.find_iter(text).map(|m| m.range()))
            .collect();
        regions.sort_by_key(|r| r.start);
        regions
    }

    fn overlaps(regions: &[Range<usize>], span: &Range<usize>) -> bool {
        regions
            .iter()
            .any(|r| span.start < r.end && r.start < span.end)
    }

    fn is_word_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_'
    }

    fn is_candidate(name: &str, options: &MatchOptions) -> bool {
        name.chars().count() >= options.min_length
            && !STOP_WORDS.contains(&name.to_lowercase().as_str())
    }

    fn name_pattern(name: &str, options: &MatchOptions) -> Result<Regex, BacklinkError> {
        let escaped = regex::escape(name);
        let pattern = if options.whole_words {
            format!(r"\b{escaped}\b")
        } else {
            escaped
        };
        RegexBuilder::new(&pattern)
            .case_insensitive(!options.case_sensitive)
            .build()
            .map_err(|source| BacklinkError::Pattern {
                name: name.to_string(),
                source,
            })
    }

    /// Scan `text` for mentions of `corpus` names, in corpus order.
    ///
    /// Each accepted match is rewritten into the buffer before scanning continues, so a shorter
    /// name never matches inside a link created for a longer one.
    pub fn find_backlinks<'a>(
        text: &str,
        corpus: impl IntoIterator<Item = &'a BacklinkCandidate>,
        options: &MatchOptions,
    ) -> Result<BacklinkScan, BacklinkError> {
        let mut buffer = text.to_string();
        let mut matches = Vec::new();
        if buffer.trim().is_empty() {
            return Ok(BacklinkScan { matches, text: buffer });
        }

        let mut regions = skip_regions(&buffer);
        for candidate in corpus {
            let name = candidate.document_name.as_str();
            if !is_candidate(name, options) {
                continue;
            }
            let re = name_pattern(name, options)?;
            let link = format!("[[{name}]]");

            let mut pos = 0;
            while let Some(found) = re.find_at(&buffer, pos) {
                let span = found.range();
                pos = span.end;
                if overlaps(&regions, &span) {
                    continue;
                }

                let before: String = buffer[..span.start].chars().rev().take(2).collect();
                let after: String = buffer[span.end..].chars().take(2).collect();
                if before.contains("[[") || after.contains("]]") {
                    continue;
                }
                if !options.whole_words {
                    let prev = buffer[..span.start].chars().next_back();
                    let next = buffer[span.end..].chars().next();
                    if prev.is_some_and(is_word_char) || next.is_some_and(is_word_char) {
                        continue;
                    }
                }

                let old_text = found.as_str().to_string();
                buffer.replace_range(span.clone(), &link);
                debug!("{old_text:?} -> {link} at byte {}", span.start);
                matches.push(BacklinkMatch {
                    old_text,
                    new_text: link.clone(),
                    source_document_path: candidate.source_path.clone(),
                    offset: span.start,
                });
                pos = span.start + link.len();
                regions = skip_regions(&buffer);
            }
        }

        Ok(BacklinkScan { matches, text: buffer })
    }

    /* ---------------------------- Batch driver ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct BacklinkOptions {
        pub dry_run: bool,
        pub exclude_patterns: Vec<String>,
        pub min_length: usize,
        pub case_sensitive: bool,
        pub whole_words: bool,
        pub batch_size: usize,
    }

    impl Default for BacklinkOptions {
        fn default() -> Self {
            Self {
                dry_run: true,
                exclude_patterns: Vec::new(),
                min_length: 3,
                case_sensitive: false,
                whole_words: true,
                batch_size: 50,
            }
        }
    }

    impl BacklinkOptions {
        /// Check ranges and compile the exclude patterns (`*` matches any run of characters).
        pub fn validate(&self) -> Result<Vec<Regex>, BacklinkError> {
            let (lo, hi) = MIN_LENGTH_RANGE;
            if !(lo..=hi).contains(&self.min_length) {
                return Err(BacklinkError::InvalidOption(format!(
                    "minLength must be between {lo} and {hi}, got {}",
                    self.min_length
                )));
            }
            let (lo, hi) = BATCH_SIZE_RANGE;
            if !(lo..=hi).contains(&self.batch_size) {
                return Err(BacklinkError::InvalidOption(format!(
                    "batchSize must be between {lo} and {hi}, got {}",
                    self.batch_size
                )));
            }
            self.exclude_patterns
                .iter()
                .map(|pattern| {
                    Regex::new(&pattern.replace('*', ".*")).map_err(|source| {
                        BacklinkError::InvalidExcludePattern {
                            pattern: pattern.clone(),
                            source,
                        }
                    })
                })
                .collect()
        }

        pub fn match_options(&self) -> MatchOptions {
            MatchOptions {
                min_length: self.min_length,
                case_sensitive: self.case_sensitive,
                whole_words: self.whole_words,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct BacklinkChange {
        pub path: String,
        pub old_text: String,
        pub new_text: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct BacklinkReport {
        pub dry_run: bool,
        pub total_documents: usize,
        pub processed_documents: usize,
        pub modified_documents: usize,
        pub total_links_added: usize,
        pub errors: Vec<String>,
        pub changes: Vec<BacklinkChange>,
        pub per_document: IndexMap<String, usize>,
    }

    impl fmt::Display for BacklinkReport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            writeln!(f, "Backlink results:")?;
            writeln!(f, "================================")?;
            writeln!(f, "Total documents: {}", self.total_documents)?;
            writeln!(f, "Processed documents: {}", self.processed_documents)?;
            writeln!(f, "Modified documents: {}", self.modified_documents)?;
            writeln!(f, "Total links added: {}", self.total_links_added)?;

            if !self.errors.is_empty() {
                writeln!(f, "\nErrors ({}):", self.errors.len())?;
                for (idx, err) in self.errors.iter().enumerate() {
                    writeln!(f, "{}. {err}", idx + 1)?;
                }
            }

            if self.dry_run && !self.changes.is_empty() {
                writeln!(f, "\nPreview of changes (first {PREVIEW_LIMIT}):")?;
                for (idx, change) in self.changes.iter().take(PREVIEW_LIMIT).enumerate() {
                    writeln!(
                        f,
                        "{}. {}: {:?} -> {:?}",
                        idx + 1,
                        change.path,
                        change.old_text,
                        change.new_text
                    )?;
                }
                if self.changes.len() > PREVIEW_LIMIT {
                    writeln!(f, "... and {} more changes", self.changes.len() - PREVIEW_LIMIT)?;
                }
                writeln!(f, "\nDry run: no documents were modified.")?;
            } else if !self.dry_run && self.modified_documents > 0 {
                writeln!(f, "\nChanges have been applied.")?;
            }
            Ok(())
        }
    }

    /// Link every document in the store against the whole corpus.
    ///
    /// Option and listing failures reject the call; a failing document is recorded in
    /// `errors` and the run moves on.
    ///
    /// Accepted matches are not replayed as `Replace` edits: each document's rewritten scan
    /// buffer is persisted with a single `NoteStore::write`, so a name mentioned twice never
    /// nests into `[[[[Name]]]]` and occurrences inside skip regions stay untouched.
    pub fn process_vault<S: NoteStore + ?Sized>(
        store: &S,
        options: &BacklinkOptions,
    ) -> Result<BacklinkReport, BacklinkError> {
        let excludes = options.validate()?;
        let match_options = options.match_options();
        if !options.dry_run {
            warn!("backlink run will modify documents in place");
        }

        let corpus = build_corpus(&store.list(None, true)?);
        let targets: Vec<&BacklinkCandidate> = corpus
            .iter()
            .filter(|c| !excludes.iter().any(|re| re.is_match(&c.source_path)))
            .collect();

        let mut report = BacklinkReport {
            dry_run: options.dry_run,
            total_documents: targets.len(),
            ..BacklinkReport::default()
        };
        info!(
            "linking {} of {} documents in batches of {}",
            targets.len(),
            corpus.len(),
            options.batch_size
        );

        let batches = targets.chunks(options.batch_size);
        let batch_count = batches.len();
        for (idx, batch) in batches.enumerate() {
            debug!("batch {}/{batch_count}", idx + 1);
            for doc in batch {
                let path = doc.source_path.as_str();
                match link_document(store, path, &corpus, &match_options, options.dry_run) {
                    Ok(scan) => {
                        report.processed_documents += 1;
                        if scan.matches.is_empty() {
                            continue;
                        }
                        report.modified_documents += 1;
                        report.total_links_added += scan.matches.len();
                        report
                            .per_document
                            .insert(path.to_string(), scan.matches.len());
                        report
                            .changes
                            .extend(scan.matches.into_iter().map(|m| BacklinkChange {
                                path: path.to_string(),
                                old_text: m.old_text,
                                new_text: m.new_text,
                            }));
                    }
                    Err(err) => {
                        let message = format!("Error processing document {path}: {err}");
                        warn!("{message}");
                        report.errors.push(message);
                    }
                }
            }
            if idx + 1 < batch_count {
                thread::sleep(BATCH_PAUSE);
            }
        }

        info!(
            "{} link(s) across {} document(s), {} error(s)",
            report.total_links_added,
            report.modified_documents,
            report.errors.len()
        );
        Ok(report)
    }

    fn link_document<S: NoteStore + ?Sized>(
        store: &S,
        path: &str,
        corpus: &[BacklinkCandidate],
        options: &MatchOptions,
        dry_run: bool,
    ) -> Result<BacklinkScan, BacklinkError> {
        let text = normalize_line_endings(&store.read(path)?);
        let others = corpus.iter().filter(|c| c.source_path != path);
        let scan = find_backlinks(&text, others, options)?;
        if !dry_run && !scan.matches.is_empty() {
            store.write(path, &scan.text)?;
        }
        Ok(scan)
    }

}

pub mod config {
    //! Vault location and the paths hidden from every store operation.

    use log::warn;
    use serde::Deserialize;
    use std::{
        env, fs, io,
        path::{Path, PathBuf},
    };

    pub const VAULT_ENV: &str = "MDPATCH_VAULT";
    pub const DEFAULT_VAULT: &str = "./vault";
    pub const DEFAULT_EXCLUSIONS: &[&str] = &[".obsidian", ".git", ".DS_Store"];
    const ALWAYS_HIDDEN: &[&str] = &[".DS_Store", ".git"];

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct VaultConfig {
        pub root: PathBuf,
        pub exclusions: Vec<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct AppSettings {
        #[serde(default)]
        user_ignore_filters: Vec<String>,
    }

    impl VaultConfig {
        /// Config with the default exclusions only.
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self {
                root: root.into(),
                exclusions: DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect(),
            }
        }

        /// Resolve the root (explicit, then `MDPATCH_VAULT`, then `./vault`) and read the
        /// vault's own ignore filters.
        pub fn load(root: Option<PathBuf>) -> io::Result<Self> {
            let root = root
                .or_else(|| env::var_os(VAULT_ENV).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_VAULT));
            let root = if root.is_absolute() {
                root
            } else {
                env::current_dir()?.join(root)
            };
            let exclusions = load_exclusions(&root);
            Ok(Self { root, exclusions })
        }

        /// Whether a vault-relative path is hidden.
        pub fn is_excluded(&self, rel_path: &str) -> bool {
            let path = rel_path.replace('\\', "/");
            let path = path.trim_end_matches('/');
            let base = path.rsplit('/').next().unwrap_or(path);
            if ALWAYS_HIDDEN.contains(&base) {
                return true;
            }

            self.exclusions.iter().any(|entry| {
                let entry = entry.replace('\\', "/");
                match entry.strip_suffix('/') {
                    Some(dir) => path == dir || path.starts_with(entry.as_str()),
                    None => {
                        path == entry
                            || path
                                .strip_prefix(entry.as_str())
                                .is_some_and(|rest| rest.starts_with('/'))
                    }
                }
            })
        }
    }

    /// Defaults plus `userIgnoreFilters` from `<root>/.obsidian/app.json`.
    pub fn load_exclusions(root: &Path) -> Vec<String> {
        let mut exclusions: Vec<String> = DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect();
        let settings_path = root.join(".obsidian").join("app.json");
        let raw = match fs::read_to_string(&settings_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return exclusions,
            Err(e) => {
                warn!("could not read {}: {e}", settings_path.display());
                return exclusions;
            }
        };
        match serde_json::from_str::<AppSettings>(&raw) {
            Ok(settings) => exclusions.extend(settings.user_ignore_filters),
            Err(e) => warn!("ignoring malformed {}: {e}", settings_path.display()),
        }
        exclusions
    }

}

pub mod storage {
    //! Where documents live. The engine only ever sees vault-relative `/`-separated paths.

    use crate::config::VaultConfig;
    use log::{debug, info};
    use std::{
        cell::{Cell, RefCell},
        collections::BTreeMap,
        fs,
        io::{self, Write},
        path::{Component, Path, PathBuf},
    };
    use tempfile::NamedTempFile;

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("document not found: {0}")]
        NotFound(String),
        #[error("invalid path {path:?}: {reason}")]
        InvalidPath { path: String, reason: &'static str },
        #[error("destination already exists: {0}")]
        AlreadyExists(String),
        #[error("I/O error on {}: {source}", path.display())]
        Io {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
    }

    impl StoreError {
        fn io(path: &Path, source: io::Error) -> Self {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Backing store for documents.
    pub trait NoteStore {
        /// Sorted document paths under `folder` (the whole store when `None`).
        fn list(&self, folder: Option<&str>, recursive: bool) -> Result<Vec<String>, StoreError>;

        fn read(&self, path: &str) -> Result<String, StoreError>;

        /// Replace the whole document; readers never observe a partial write.
        fn write(&self, path: &str, text: &str) -> Result<(), StoreError>;
    }

    /* ---------------------------- Filesystem vault ---------------------------- */

    #[derive(Debug, Clone)]
    pub struct FsVault {
        config: VaultConfig,
    }

    impl FsVault {
        pub fn new(config: VaultConfig) -> Self {
            Self { config }
        }

        pub fn root(&self) -> &Path {
            &self.config.root
        }

        pub fn config(&self) -> &VaultConfig {
            &self.config
        }

        /// Absolute location of a vault-relative path. Rejects anything escaping the root.
        pub fn resolve(&self, rel_path: &str) -> Result<PathBuf, StoreError> {
            let invalid = |reason| StoreError::InvalidPath {
                path: rel_path.to_string(),
                reason,
            };
            let normalized = rel_path.replace('\\', "/");
            if normalized.trim_matches('/').is_empty() {
                return Err(invalid("empty path"));
            }
            let rel = Path::new(&normalized);
            for component in rel.components() {
                match component {
                    Component::Normal(_) | Component::CurDir => {}
                    Component::ParentDir => return Err(invalid("parent directory components")),
                    Component::RootDir | Component::Prefix(_) => {
                        return Err(invalid("absolute paths are not allowed"));
                    }
                }
            }
            Ok(self.config.root.join(rel))
        }

        /// Write a new document. Excluded locations are refused.
        pub fn create(&self, path: &str, text: &str) -> Result<(), StoreError> {
            self.write(path, text)?;
            info!("created {path}");
            Ok(())
        }

        /* ---------------------------- Vault management ---------------------------- */

        /// Remove a document, then its folder if that left it empty.
        pub fn delete(&self, path: &str) -> Result<(), StoreError> {
            let abs = self.existing(path, Path::is_file)?;
            fs::remove_file(&abs).map_err(|e| StoreError::io(&abs, e))?;
            self.prune_empty_parent(&abs);
            info!("deleted {path}");
            Ok(())
        }

        /// Move a document. The destination must not exist; its folders are created.
        pub fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
            let src = self.existing(from, Path::is_file)?;
            let dst = self.vacant(to)?;
            move_path(&src, &dst)?;
            self.prune_empty_parent(&src);
            info!("moved {from} -> {to}");
            Ok(())
        }

        /// Create a folder and any missing parents. Existing folders are left alone.
        pub fn create_folder(&self, path: &str) -> Result<(), StoreError> {
            let abs = self.resolve(path)?;
            if self.config.is_excluded(path) {
                return Err(StoreError::InvalidPath {
                    path: path.to_string(),
                    reason: "path is excluded",
                });
            }
            fs::create_dir_all(&abs).map_err(|e| StoreError::io(&abs, e))?;
            info!("created folder {path}");
            Ok(())
        }

        /// Rename or move a folder with everything below it.
        pub fn rename_folder(&self, from: &str, to: &str) -> Result<(), StoreError> {
            let src = self.existing(from, Path::is_dir)?;
            let dst = self.vacant(to)?;
            move_path(&src, &dst)?;
            info!("moved folder {from} -> {to}");
            Ok(())
        }

        /// Delete a folder recursively.
        pub fn delete_folder(&self, path: &str) -> Result<(), StoreError> {
            let abs = self.existing(path, Path::is_dir)?;
            fs::remove_dir_all(&abs).map_err(|e| StoreError::io(&abs, e))?;
            info!("deleted folder {path}");
            Ok(())
        }

        /// Resolved path of a visible entry accepted by `kind`.
        fn existing(&self, path: &str, kind: fn(&Path) -> bool) -> Result<PathBuf, StoreError> {
            let abs = self.resolve(path)?;
            if self.config.is_excluded(path) || !kind(&abs) {
                return Err(StoreError::NotFound(path.to_string()));
            }
            Ok(abs)
        }

        /// Resolved path of a move destination: visible and not yet taken.
        fn vacant(&self, path: &str) -> Result<PathBuf, StoreError> {
            let abs = self.resolve(path)?;
            if self.config.is_excluded(path) {
                return Err(StoreError::InvalidPath {
                    path: path.to_string(),
                    reason: "path is excluded",
                });
            }
            if abs.symlink_metadata().is_ok() {
                return Err(StoreError::AlreadyExists(path.to_string()));
            }
            Ok(abs)
        }

        fn prune_empty_parent(&self, abs: &Path) {
            let Some(dir) = abs.parent() else {
                return;
            };
            if dir == self.config.root {
                return;
            }
            let empty = fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none());
            if empty {
                match fs::remove_dir(dir) {
                    Ok(()) => debug!("removed empty folder {}", dir.display()),
                    Err(e) => debug!("leaving {}: {e}", dir.display()),
                }
            }
        }

        fn walk(
            &self,
            dir: &Path,
            rel_dir: &str,
            recursive: bool,
            out: &mut Vec<String>,
        ) -> Result<(), StoreError> {
            let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| StoreError::io(dir, e))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let rel = if rel_dir.is_empty() {
                    name
                } else {
                    format!("{rel_dir}/{name}")
                };
                if self.config.is_excluded(&rel) {
                    continue;
                }

                let file_type = entry.file_type().map_err(|e| StoreError::io(&entry.path(), e))?;
                if file_type.is_symlink() {
                    debug!("skipping symlink {rel}");
                } else if file_type.is_dir() {
                    if recursive {
                        self.walk(&entry.path(), &rel, recursive, out)?;
                    }
                } else if file_type.is_file() {
                    out.push(rel);
                }
            }
            Ok(())
        }
    }

    impl NoteStore for FsVault {
        fn list(&self, folder: Option<&str>, recursive: bool) -> Result<Vec<String>, StoreError> {
            let folder = folder.map(|f| f.trim_matches('/')).unwrap_or("");
            let dir = if folder.is_empty() {
                self.config.root.clone()
            } else {
                if self.config.is_excluded(folder) {
                    return Err(StoreError::NotFound(folder.to_string()));
                }
                self.resolve(folder)?
            };
            if !dir.is_dir() {
                return Err(StoreError::NotFound(folder.to_string()));
            }

            let mut out = Vec::new();
            self.walk(&dir, folder, recursive, &mut out)?;
            out.sort();
            debug!("listed {} file(s) under {:?}", out.len(), folder);
            Ok(out)
        }

        fn read(&self, path: &str) -> Result<String, StoreError> {
            let abs = self.resolve(path)?;
            if self.config.is_excluded(path) {
                return Err(StoreError::NotFound(path.to_string()));
            }
            fs::read_to_string(&abs).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => StoreError::NotFound(path.to_string()),
                _ => StoreError::io(&abs, e),
            })
        }

        fn write(&self, path: &str, text: &str) -> Result<(), StoreError> {
            let abs = self.resolve(path)?;
            if self.config.is_excluded(path) {
                return Err(StoreError::InvalidPath {
                    path: path.to_string(),
                    reason: "path is excluded",
                });
            }
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
            write_atomic(&abs, text).map_err(|e| StoreError::io(&abs, e))?;
            debug!("wrote {} byte(s) to {path}", text.len());
            Ok(())
        }
    }

    fn move_path(src: &Path, dst: &Path) -> Result<(), StoreError> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        fs::rename(src, dst).map_err(|e| StoreError::io(src, e))
    }

    /// Write through a temporary file in the target's directory, then rename over the target.
    /// The temporary file is gone on every failure path.
    pub fn write_atomic(target: &Path, text: &str) -> io::Result<()> {
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(target).map_err(|e| e.error)?;
        Ok(())
    }

    /* ------------------------------ In-memory ------------------------------ */

    /// Map-backed store that counts writes.
    #[derive(Debug, Default)]
    pub struct MemoryStore {
        notes: RefCell<BTreeMap<String, String>>,
        writes: Cell<usize>,
        fail_writes: Cell<bool>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_notes<I, K, V>(notes: I) -> Self
        where
            I: IntoIterator<Item = (K, V)>,
            K: Into<String>,
            V: Into<String>,
        {
            let store = Self::new();
            store
                .notes
                .borrow_mut()
                .extend(notes.into_iter().map(|(k, v)| (k.into(), v.into())));
            store
        }

        pub fn get(&self, path: &str) -> Option<String> {
            self.notes.borrow().get(path).cloned()
        }

        /// Successful writes so far.
        pub fn write_count(&self) -> usize {
            self.writes.get()
        }

        /// Make every following write fail with an I/O error.
        pub fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.set(fail);
        }
    }

    impl NoteStore for MemoryStore {
        fn list(&self, folder: Option<&str>, recursive: bool) -> Result<Vec<String>, StoreError> {
            let prefix = match folder.map(|f| f.trim_matches('/')) {
                Some(f) if !f.is_empty() => format!("{f}/"),
                _ => String::new(),
            };
            Ok(self
                .notes
                .borrow()
                .keys()
                .filter_map(|k| k.strip_prefix(prefix.as_str()).map(|rest| (k, rest)))
                .filter(|(_, rest)| recursive || !rest.contains('/'))
                .map(|(k, _)| k.clone())
                .collect())
        }

        fn read(&self, path: &str) -> Result<String, StoreError> {
            self.get(path)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))
        }

        fn write(&self, path: &str, text: &str) -> Result<(), StoreError> {
            if self.fail_writes.get() {
                return Err(StoreError::io(
                    Path::new(path),
                    io::Error::other("writes disabled"),
                ));
            }
            self.notes
                .borrow_mut()
                .insert(path.to_string(), text.to_string());
            self.writes.set(self.writes.get() + 1);
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::apply::{EditOutcome, EditRequest};
        use crate::core::{Position, RawEdit};
        use tempfile::{tempdir, TempDir};

        fn vault_with(files: &[(&str, &str)]) -> (TempDir, FsVault) {
            let dir = tempdir().expect("tempdir");
            for (rel, text) in files {
                let path = dir.path().join(rel);
                fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
                fs::write(&path, text).expect("write");
            }
            let mut config = VaultConfig::new(dir.path());
            config.exclusions.push("Private/".into());
            (dir, FsVault::new(config))
        }

        fn dir_entries(dir: &Path) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(dir)
                .expect("read_dir")
                .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }

        #[test]
        fn list_skips_excluded_and_sorts() {
            let (_dir, vault) = vault_with(&[
                ("b.md", ""),
                ("a/nested.md", ""),
                ("a/deeper/x.txt", ""),
                (".obsidian/app.json", "{}"),
                ("a/.DS_Store", ""),
                ("Private/secret.md", ""),
            ]);
            let all = vault.list(None, true).expect("list");
            assert_eq!(all, vec!["a/deeper/x.txt", "a/nested.md", "b.md"]);

            let top = vault.list(None, false).expect("list");
            assert_eq!(top, vec!["b.md"]);

            let sub = vault.list(Some("a/"), false).expect("list");
            assert_eq!(sub, vec!["a/nested.md"]);
        }

        #[test]
        fn excluded_or_missing_folder_is_not_found() {
            let (_dir, vault) = vault_with(&[("Private/secret.md", "")]);
            assert!(matches!(vault.list(Some("Private"), true), Err(StoreError::NotFound(_))));
            assert!(matches!(vault.list(Some("nope"), true), Err(StoreError::NotFound(_))));
        }

        #[cfg(unix)]
        #[test]
        fn list_skips_symlinks() {
            let (dir, vault) = vault_with(&[("real.md", "x")]);
            std::os::unix::fs::symlink(dir.path().join("real.md"), dir.path().join("link.md"))
                .expect("symlink");
            assert_eq!(vault.list(None, true).expect("list"), vec!["real.md"]);
        }

        #[test]
        fn read_hides_missing_and_excluded() {
            let (_dir, vault) = vault_with(&[("note.md", "hi"), ("Private/s.md", "secret")]);
            assert_eq!(vault.read("note.md").expect("read"), "hi");
            assert!(matches!(vault.read("gone.md"), Err(StoreError::NotFound(_))));
            assert!(matches!(vault.read("Private/s.md"), Err(StoreError::NotFound(_))));
        }

        #[test]
        fn paths_outside_the_vault_are_rejected() {
            let (_dir, vault) = vault_with(&[]);
            for bad in ["../escape.md", "a/../../b.md", "/etc/passwd", ""] {
                assert!(
                    matches!(vault.resolve(bad), Err(StoreError::InvalidPath { .. })),
                    "{bad}"
                );
            }
            assert!(vault.resolve("a/./b.md").is_ok());
        }

        #[test]
        fn write_creates_parents_and_leaves_no_temp_files() {
            let (dir, vault) = vault_with(&[]);
            vault.write("new/dir/note.md", "first").expect("write");
            vault.write("new/dir/note.md", "second").expect("overwrite");
            assert_eq!(vault.read("new/dir/note.md").expect("read"), "second");
            assert_eq!(dir_entries(&dir.path().join("new/dir")), vec!["note.md"]);
        }

        #[test]
        fn create_refuses_excluded_paths() {
            let (dir, vault) = vault_with(&[]);
            let err = vault.create(".obsidian/x.md", "no").expect_err("excluded");
            assert!(matches!(err, StoreError::InvalidPath { .. }));
            assert!(!dir.path().join(".obsidian").exists());
            vault.create("ok.md", "yes").expect("create");
            assert_eq!(vault.read("ok.md").expect("read"), "yes");
        }

        #[test]
        fn failed_rename_keeps_target_and_removes_temp_file() {
            let dir = tempdir().expect("tempdir");
            let target = dir.path().join("note.md");
            fs::create_dir(&target).expect("mkdir");
            fs::write(target.join("keep"), "kept").expect("write");

            assert!(write_atomic(&target, "replacement").is_err());
            assert!(target.is_dir());
            assert_eq!(fs::read_to_string(target.join("keep")).expect("read"), "kept");
            assert_eq!(dir_entries(dir.path()), vec!["note.md"]);
        }

        #[test]
        fn edit_batch_round_trips_through_the_vault() {
            let (_dir, vault) = vault_with(&[("log.md", "# Log\r\nentry\r\n# Later\r\n")]);
            let request = EditRequest::new(
                "log.md",
                vec![RawEdit::insert_at_heading("Log", "second", Position::Append)],
                false,
            );
            let outcome = request.execute(&vault).expect("edit");
            assert!(matches!(outcome, EditOutcome::Written { applied: 1, .. }));
            assert_eq!(
                vault.read("log.md").expect("read"),
                "# Log\nentry\nsecond\n# Later\n"
            );
        }

        #[cfg(unix)]
        #[test]
        fn failed_write_leaves_existing_note_byte_identical() {
            use std::os::unix::fs::PermissionsExt;

            let (dir, vault) = vault_with(&[("locked/note.md", "original\r\nbytes")]);
            let folder = dir.path().join("locked");
            fs::set_permissions(&folder, fs::Permissions::from_mode(0o555)).expect("chmod");
            // Privileged users ignore directory permissions; nothing to observe then.
            let enforced = fs::File::create(folder.join("canary")).is_err();

            if enforced {
                let err = vault.write("locked/note.md", "replacement").expect_err("read-only");
                assert!(matches!(err, StoreError::Io { .. }));
                assert_eq!(
                    fs::read(folder.join("note.md")).expect("read"),
                    b"original\r\nbytes"
                );
                assert_eq!(dir_entries(&folder), vec!["note.md"]);
            }
            fs::set_permissions(&folder, fs::Permissions::from_mode(0o755)).expect("chmod back");
        }

        #[test]
        fn delete_removes_note_and_empty_folder() {
            let (dir, vault) = vault_with(&[("a/only.md", "x"), ("b/one.md", "1"), ("b/two.md", "2")]);
            vault.delete("a/only.md").expect("delete");
            assert!(!dir.path().join("a").exists());

            vault.delete("b/one.md").expect("delete");
            assert_eq!(dir_entries(&dir.path().join("b")), vec!["two.md"]);

            assert!(matches!(vault.delete("b/one.md"), Err(StoreError::NotFound(_))));
            assert!(matches!(vault.delete("b"), Err(StoreError::NotFound(_))));
        }

        #[test]
        fn delete_refuses_excluded_notes() {
            let (dir, vault) = vault_with(&[("Private/s.md", "secret")]);
            assert!(matches!(vault.delete("Private/s.md"), Err(StoreError::NotFound(_))));
            assert!(dir.path().join("Private/s.md").exists());
        }

        #[test]
        fn rename_moves_note_and_cleans_source_folder() {
            let (dir, vault) = vault_with(&[("inbox/idea.md", "idea"), ("keep.md", "k")]);
            vault.rename("inbox/idea.md", "projects/2024/idea.md").expect("move");
            assert_eq!(vault.read("projects/2024/idea.md").expect("read"), "idea");
            assert!(!dir.path().join("inbox").exists());

            assert!(matches!(
                vault.rename("projects/2024/idea.md", "keep.md"),
                Err(StoreError::AlreadyExists(_))
            ));
            assert!(matches!(
                vault.rename("keep.md", "Private/keep.md"),
                Err(StoreError::InvalidPath { .. })
            ));
            assert!(matches!(
                vault.rename("missing.md", "elsewhere.md"),
                Err(StoreError::NotFound(_))
            ));
            assert_eq!(vault.read("keep.md").expect("read"), "k");
        }

        #[test]
        fn folder_lifecycle() {
            let (dir, vault) = vault_with(&[("old/a.md", "a"), ("old/sub/b.md", "b")]);
            vault.create_folder("fresh/nested").expect("create");
            assert!(dir.path().join("fresh/nested").is_dir());
            vault.create_folder("fresh/nested").expect("idempotent");

            vault.rename_folder("old", "archive/old").expect("move");
            assert_eq!(
                vault.list(Some("archive"), true).expect("list"),
                vec!["archive/old/a.md", "archive/old/sub/b.md"]
            );
            assert!(matches!(
                vault.rename_folder("archive/old", "fresh"),
                Err(StoreError::AlreadyExists(_))
            ));

            vault.delete_folder("archive").expect("delete");
            assert!(!dir.path().join("archive").exists());
            assert!(matches!(vault.delete_folder("archive"), Err(StoreError::NotFound(_))));
        }

        #[test]
        fn folder_operations_respect_exclusions() {
            let (dir, vault) = vault_with(&[("notes/a.md", "a"), ("Private/s.md", "s")]);
            assert!(matches!(
                vault.create_folder(".obsidian/plugins"),
                Err(StoreError::InvalidPath { .. })
            ));
            assert!(matches!(
                vault.rename_folder("notes", "Private/notes"),
                Err(StoreError::InvalidPath { .. })
            ));
            assert!(matches!(vault.delete_folder("Private"), Err(StoreError::NotFound(_))));
            assert!(dir.path().join("Private/s.md").exists());
            assert!(matches!(vault.delete_folder("../x"), Err(StoreError::InvalidPath { .. })));
        }

        #[test]
        fn memory_store_lists_by_folder() {
            let store = MemoryStore::with_notes([("a/x.md", ""), ("a/b/y.md", ""), ("z.md", "")]);
            assert_eq!(store.list(None, true).expect("list"), vec!["a/b/y.md", "a/x.md", "z.md"]);
            assert_eq!(store.list(Some("a"), false).expect("list"), vec!["a/x.md"]);
        }
    }
}

pub mod search {
    //! Plain case-insensitive lookup over document names and text.

    use crate::storage::{NoteStore, StoreError};
    use log::debug;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum MatchType {
        Filename,
        Content,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SearchHit {
        pub path: String,
        /// 2 when the path matches, 1 for a text-only match.
        pub score: u8,
        pub match_type: MatchType,
        /// Zero-based first matching line of the text, when the text matches at all.
        pub line: Option<usize>,
    }

    /// Every listed document whose path or text contains `query`, in listing order.
    pub fn search<S: NoteStore + ?Sized>(store: &S, query: &str) -> Result<Vec<SearchHit>, StoreError> {
        let needle = query.to_lowercase();
        if needle.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        for path in store.list(None, true)? {
            let by_name = path.to_lowercase().contains(&needle);
            let line = match store.read(&path) {
                Ok(text) => text
                    .split('\n')
                    .position(|l| l.to_lowercase().contains(&needle)),
                Err(e) => {
                    debug!("searching {path} by name only: {e}");
                    None
                }
            };
            if !by_name && line.is_none() {
                continue;
            }
            hits.push(SearchHit {
                score: if by_name { 2 } else { 1 },
                match_type: if by_name {
                    MatchType::Filename
                } else {
                    MatchType::Content
                },
                line,
                path,
            });
        }
        debug!("{} hit(s) for {query:?}", hits.len());
        Ok(hits)
    }

    /// Each document's text, or an inline error line, separated by `---`.
    pub fn read_many<S: NoteStore + ?Sized, P: AsRef<str>>(store: &S, paths: &[P]) -> String {
        paths
            .iter()
            .map(|path| {
                let path = path.as_ref();
                match store.read(path) {
                    Ok(text) => format!("{path}:\n{text}\n"),
                    Err(e) => format!("{path}: Error - {e}"),
                }
            })
            .collect::<Vec<_>>()
            .join("\n---\n")
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::storage::MemoryStore;

        fn store() -> MemoryStore {
            MemoryStore::with_notes([
                ("projects/Roadmap.md", "# Plan\nship it"),
                ("daily/today.md", "intro\nmet about the ROADMAP\nend"),
                ("other.md", "nothing here"),
            ])
        }

        #[test]
        fn name_hits_outscore_text_hits() {
            let hits = search(&store(), "roadmap").expect("search");
            assert_eq!(
                hits,
                vec![
                    SearchHit {
                        path: "daily/today.md".into(),
                        score: 1,
                        match_type: MatchType::Content,
                        line: Some(1),
                    },
                    SearchHit {
                        path: "projects/Roadmap.md".into(),
                        score: 2,
                        match_type: MatchType::Filename,
                        line: None,
                    },
                ]
            );
        }

        #[test]
        fn blank_query_matches_nothing() {
            assert!(search(&store(), "  ").expect("search").is_empty());
        }

        #[test]
        fn hits_serialize_camel_case() {
            let hits = search(&store(), "ship").expect("search");
            let json = serde_json::to_value(&hits[0]).expect("json");
            assert_eq!(json["matchType"], "content");
            assert_eq!(json["line"], 1);
        }

        #[test]
        fn read_many_reports_failures_inline() {
            let out = read_many(&store(), &["other.md", "missing.md"]);
            assert_eq!(
                out,
                "other.md:\nnothing here\n\n---\nmissing.md: Error - document not found: missing.md"
            );
        }
    }
}

pub use apply::{EditOutcome, EditRequest, EditSession, apply_edits};
pub use backlink::{BacklinkOptions, BacklinkReport, process_vault};
pub use config::VaultConfig;
pub use crate::core::{EditError, EditOperation, Position, RawEdit, StructuralElement};
pub use diff::unified_diff;
pub use parser::parse_document;
pub use search::{SearchHit, read_many, search};
pub use storage::{FsVault, MemoryStore, NoteStore, StoreError};
