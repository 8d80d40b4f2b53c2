//! Markdown task library: finds checkbox tasks in markdown bodies, decodes their
//! inline annotations, folds them into per-file groups and rewrites single task
//! lines in place. Everything except `workspace` is pure and performs no I/O.

pub mod core {
    //! Task model shared by every component. Records are recomputed from file
    //! content on each read; an id is only as stable as the line it points at.

    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};
    use serde_with::skip_serializing_none;
    use std::{
        collections::HashMap,
        fmt,
        path::{Path, PathBuf},
        str::FromStr,
    };

    /* ------------------------------ Status ------------------------------ */

    /// Lifecycle state of a task. Any state can move to any other in one update.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TaskStatus {
        #[default]
        Todo,
        InProgress,
        Done,
    }

    impl TaskStatus {
        /// Status implied by the character between the checkbox brackets.
        pub fn from_marker(marker: char) -> Self {
            match marker {
                'x' | 'X' => Self::Done,
                '~' => Self::InProgress,
                _ => Self::Todo,
            }
        }

        /// Lenient mapping for update requests: anything unrecognised is `Todo`.
        pub fn from_request(value: &str) -> Self {
            match value {
                "done" => Self::Done,
                "in_progress" => Self::InProgress,
                _ => Self::Todo,
            }
        }

        /// Checkbox text written back into a task line.
        pub fn checkbox(self) -> &'static str {
            match self {
                Self::Todo => "[ ]",
                Self::InProgress => "[~]",
                Self::Done => "[x]",
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                Self::Todo => "todo",
                Self::InProgress => "in_progress",
                Self::Done => "done",
            }
        }
    }

    impl fmt::Display for TaskStatus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for TaskStatus {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.to_ascii_lowercase().as_str() {
                "todo" => Ok(Self::Todo),
                "in_progress" | "in-progress" => Ok(Self::InProgress),
                "done" => Ok(Self::Done),
                _ => Err(DomainError::InvalidStatus(s.to_string())),
            }
        }
    }

    /* ----------------------------- Priority ----------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Priority {
        Low,
        Medium,
        High,
    }

    impl Priority {
        pub fn as_str(self) -> &'static str {
            match self {
                Self::Low => "low",
                Self::Medium => "medium",
                Self::High => "high",
            }
        }
    }

    impl FromStr for Priority {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.to_ascii_lowercase().as_str() {
                "low" => Ok(Self::Low),
                "medium" => Ok(Self::Medium),
                "high" => Ok(Self::High),
                _ => Err(DomainError::InvalidPriority(s.to_string())),
            }
        }
    }

    /* ------------------------------- Type ------------------------------- */

    /// Task category, decided by the folder a file lives in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum TaskType {
        Doc,
        Epic,
        Story,
        Bug,
        Custom,
    }

    impl TaskType {
        /// Files outside any folder count as docs.
        pub fn from_folder(folder: Option<&str>) -> Self {
            match folder {
                None | Some("docs") => Self::Doc,
                Some("epics") => Self::Epic,
                Some("stories") => Self::Story,
                Some("bugs") => Self::Bug,
                Some(_) => Self::Custom,
            }
        }

        /// Display order of groups; lower sorts first.
        pub fn rank(self) -> u8 {
            match self {
                Self::Epic => 1,
                Self::Doc => 2,
                Self::Story => 3,
                Self::Custom => 4,
                Self::Bug => 5,
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                Self::Doc => "doc",
                Self::Epic => "epic",
                Self::Story => "story",
                Self::Bug => "bug",
                Self::Custom => "custom",
            }
        }
    }

    /* ----------------------------- Records ----------------------------- */

    /// Structured values decoded from inline title tokens.
    #[skip_serializing_none]
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TaskMetadata {
        pub priority: Option<Priority>,
        /// Raw `@token`; never validated at parse time.
        pub due_date: Option<String>,
        pub assignee: Option<String>,
        /// In order of appearance, duplicates kept.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub tags: Vec<String>,
    }

    impl TaskMetadata {
        pub fn is_empty(&self) -> bool {
            self.priority.is_none()
                && self.due_date.is_none()
                && self.assignee.is_none()
                && self.tags.is_empty()
        }

        /// The due token read as an ISO date. Relative tokens such as `tomorrow` give `None`.
        pub fn due_on(&self) -> Option<NaiveDate> {
            self.due_date
                .as_deref()
                .and_then(|due| NaiveDate::parse_from_str(due, "%Y-%m-%d").ok())
        }
    }

    /// One checkbox line of a markdown body.
    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TaskRecord {
        /// `{file stem}-{zero-based line index}`.
        pub id: String,
        pub title: String,
        pub completed: bool,
        pub status: TaskStatus,
        /// 1-based, counted within the body (frontmatter excluded).
        pub line: usize,
        pub file: PathBuf,
        #[serde(rename = "type")]
        pub task_type: TaskType,
        pub folder: Option<String>,
        /// Never an empty list: absent when the title had no `ref:` tokens.
        pub references: Option<Vec<String>>,
        pub metadata: Option<TaskMetadata>,
    }

    /// All tasks of one source file.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TaskGroup {
        pub id: String,
        pub name: String,
        #[serde(rename = "type")]
        pub group_type: TaskType,
        pub file: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub folder: Option<String>,
        pub subtasks: Vec<TaskRecord>,
        pub total_tasks: usize,
        pub completed_tasks: usize,
        pub pending_tasks: usize,
        pub content: String,
        pub metadata: Map<String, Value>,
    }

    /// Body and frontmatter of a source file, as handed to the grouping engine.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct FileEntry {
        pub content: String,
        pub metadata: Map<String, Value>,
    }

    /// Keyed by the same path the tasks carry in `TaskRecord::file`.
    pub type FileLookup = HashMap<PathBuf, FileEntry>;

    /* ----------------------------- Path helpers ----------------------------- */

    /// File name without its extension.
    pub fn file_stem(path: &Path) -> String {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Name of the directory directly containing `path`.
    pub fn parent_folder(path: &Path) -> Option<String> {
        path.parent()
            .and_then(Path::file_name)
            .map(|s| s.to_string_lossy().into_owned())
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("unknown task status {0:?} (expected todo, in_progress or done)")]
        InvalidStatus(String),
        #[error("unknown priority {0:?} (expected low, medium or high)")]
        InvalidPriority(String),
    }

}

pub mod tokenizer {
    //! Inline annotation tokens inside a task title.
    //!
    //! Steps run in a fixed order (references, priority, due date, assignee, tags,
    //! status) and each blanks out what it matched before the next one runs. A step
    //! takes its value from the first match but removes every match, so a cleaned
    //! title never yields further tokens.

    use crate::core::{Priority, TaskMetadata, TaskStatus};
    use regex::Regex;
    use std::sync::LazyLock;

    static REFERENCE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"ref:([A-Za-z0-9_/-]+)").expect("reference pattern"));
    static PRIORITY: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\((?:priority:\s*)?(high|medium|low)\)").expect("priority pattern")
    });
    static DUE_DATE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"@([A-Za-z0-9_-]+)").expect("due date pattern"));
    static ASSIGNEE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\+@?([A-Za-z0-9_]+)").expect("assignee pattern"));
    static TAG: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"#([A-Za-z0-9_]+)").expect("tag pattern"));
    static STATUS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\[(doing|in-progress|wip|todo|done)\]").expect("status pattern")
    });

    /// A title with its annotations pulled out.
    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
    pub struct Tokenized {
        pub title: String,
        pub metadata: Option<TaskMetadata>,
        pub references: Option<Vec<String>>,
        /// Explicit `[wip]`-style override of the checkbox status.
        pub status: Option<TaskStatus>,
    }

    pub fn tokenize(raw: &str) -> Tokenized {
        let mut work = raw.to_string();

        let references = strip_tokens(&mut work, &REFERENCE, |_, _| true);
        let priority = strip_tokens(&mut work, &PRIORITY, |_, _| true)
            .into_iter()
            .next()
            .and_then(|p| p.parse::<Priority>().ok());
        // `@name` right after `+` belongs to the assignee step.
        let due_date = strip_tokens(&mut work, &DUE_DATE, |text, at| {
            !text[..at].ends_with('+')
        })
        .into_iter()
        .next();
        let assignee = strip_tokens(&mut work, &ASSIGNEE, |_, _| true)
            .into_iter()
            .next();
        let tags = strip_tokens(&mut work, &TAG, |_, _| true);
        let status = strip_tokens(&mut work, &STATUS, |_, _| true)
            .first()
            .map(|token| status_from_token(token));

        let metadata = TaskMetadata {
            priority,
            due_date,
            assignee,
            tags,
        };

        Tokenized {
            title: collapse_whitespace(&work),
            metadata: (!metadata.is_empty()).then_some(metadata),
            references: (!references.is_empty()).then_some(references),
            status,
        }
    }

    /// Removes `[doing]`-style status tokens, leaving the rest of the text as written.
    pub fn strip_status_tokens(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for m in STATUS.find_iter(text) {
            out.push_str(&text[last..m.start()]);
            last = m.end();
            if out.ends_with(' ') && (last == text.len() || text[last..].starts_with(' ')) {
                out.pop();
            }
        }
        out.push_str(&text[last..]);
        out.trim().to_string()
    }

    fn status_from_token(token: &str) -> TaskStatus {
        match token.to_ascii_lowercase().as_str() {
            "done" => TaskStatus::Done,
            "todo" => TaskStatus::Todo,
            _ => TaskStatus::InProgress,
        }
    }

    /// Replaces each accepted match with a space and returns the first capture group of each.
    fn strip_tokens(
        text: &mut String,
        pattern: &Regex,
        accept: impl Fn(&str, usize) -> bool,
    ) -> Vec<String> {
        let source = text.as_str();
        let mut values = Vec::new();
        let mut out = String::with_capacity(source.len());
        let mut last = 0;
        for caps in pattern.captures_iter(source) {
            let (Some(whole), Some(value)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if !accept(source, whole.start()) {
                continue;
            }
            out.push_str(&source[last..whole.start()]);
            out.push(' ');
            last = whole.end();
            values.push(value.as_str().to_string());
        }
        if values.is_empty() {
            return values;
        }
        out.push_str(&source[last..]);
        *text = out;
        values
    }

    fn collapse_whitespace(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn priority_in_parentheses() {
            let t = tokenize("Task with priority (high)");
            assert_eq!(t.title, "Task with priority");
            assert_eq!(t.metadata.expect("metadata").priority, Some(Priority::High));
        }

        #[test]
        fn priority_with_label_is_case_insensitive() {
            let t = tokenize("Ship it (Priority: LOW)");
            assert_eq!(t.title, "Ship it");
            assert_eq!(t.metadata.expect("metadata").priority, Some(Priority::Low));
        }

        #[test]
        fn assignee_and_due_date() {
            let t = tokenize("Task with assignee +john @2024-01-15");
            let meta = t.metadata.expect("metadata");
            assert_eq!(meta.assignee.as_deref(), Some("john"));
            assert_eq!(meta.due_date.as_deref(), Some("2024-01-15"));
            assert_eq!(t.title, "Task with assignee");
        }

        #[test]
        fn at_prefixed_assignee_is_not_a_due_date() {
            let t = tokenize("Review +@maria @tomorrow");
            let meta = t.metadata.expect("metadata");
            assert_eq!(meta.assignee.as_deref(), Some("maria"));
            assert_eq!(meta.due_date.as_deref(), Some("tomorrow"));
            assert_eq!(t.title, "Review");
        }

        #[test]
        fn tags_keep_order_and_duplicates() {
            let t = tokenize("Task with tags #frontend #urgent");
            assert_eq!(t.metadata.expect("metadata").tags, vec!["frontend", "urgent"]);
            let t = tokenize("#b again #a #b");
            assert_eq!(t.metadata.expect("metadata").tags, vec!["b", "a", "b"]);
            assert_eq!(t.title, "again");
        }

        #[test]
        fn references_are_collected() {
            let t = tokenize("Implement feature ref:epics/epic-01");
            assert_eq!(t.references, Some(vec!["epics/epic-01".to_string()]));
            assert_eq!(t.title, "Implement feature");
            assert!(t.metadata.is_none());
        }

        #[test]
        fn reference_paths_do_not_leak_tags() {
            let t = tokenize("See ref:docs/setup_guide and ref:bugs/b-2 #infra");
            assert_eq!(
                t.references,
                Some(vec!["docs/setup_guide".to_string(), "bugs/b-2".to_string()])
            );
            assert_eq!(t.metadata.expect("metadata").tags, vec!["infra"]);
            assert_eq!(t.title, "See and");
        }

        #[test]
        fn malformed_tokens_stay_in_title() {
            let t = tokenize("Task with invalid priority (unknown)");
            assert!(t.metadata.is_none());
            assert_eq!(t.title, "Task with invalid priority (unknown)");

            let t = tokenize("  Add + remove  ");
            assert!(t.metadata.is_none());
            assert_eq!(t.title, "Add + remove");
        }

        #[test]
        fn status_tokens_override() {
            assert_eq!(tokenize("Work [WIP]").status, Some(TaskStatus::InProgress));
            assert_eq!(tokenize("Work [in-progress]").status, Some(TaskStatus::InProgress));
            assert_eq!(tokenize("[done] Work").status, Some(TaskStatus::Done));
            assert_eq!(tokenize("[todo] Work").title, "Work");
            assert_eq!(tokenize("Work [later]").status, None);
        }

        #[test]
        fn tokens_in_any_order() {
            let a = tokenize("#ui Fix login @2024-02-01 (medium) +sam ref:bugs/b-1");
            let b = tokenize("ref:bugs/b-1 +sam (medium) Fix login #ui @2024-02-01");
            assert_eq!(a, b);
            assert_eq!(a.title, "Fix login");
        }

        #[test]
        fn tokenizing_twice_extracts_nothing_new() {
            for raw in [
                "Fix (hi(high)gh) bug",
                "Plan #a#b @x@y +p+q ref:a/b [wip][done]",
                "Task (low) (high) @one @two",
                "plain title",
            ] {
                let once = tokenize(raw);
                let twice = tokenize(&once.title);
                assert_eq!(twice.title, once.title, "input {raw:?}");
                assert!(twice.metadata.is_none(), "input {raw:?}");
                assert!(twice.references.is_none(), "input {raw:?}");
                assert!(twice.status.is_none(), "input {raw:?}");
            }
        }

        #[test]
        fn strip_status_tokens_keeps_other_text() {
            assert_eq!(strip_status_tokens("Write docs [wip] #docs"), "Write docs #docs");
            assert_eq!(strip_status_tokens("[done] Write docs"), "Write docs");
            assert_eq!(strip_status_tokens("Write docs"), "Write docs");
        }
    }
}

pub mod parser {
    //! Checkbox task lines in a markdown body.
    //!
    //! Matching is per line and knows nothing about markdown block structure:
    //! `<indent>-<ws>[<marker>]<text>` where the marker is one of ` `, `x`, `X`, `~`
    //! and at least one character follows the closing bracket. Indentation is kept
    //! for rewriting but has no meaning for extraction.
    //!
    //! `scan_task_lines` and `task_id` are the only place ids come from; the
    //! serializer finds its target through the same two functions.

    use crate::core::*;
    use crate::frontmatter::{self, Document, FrontmatterError};
    use crate::tokenizer::tokenize;
    use nom::{
        IResult,
        bytes::complete::take_while,
        character::complete::{char, one_of},
        combinator::{rest, verify},
        error::VerboseError,
        sequence::delimited,
    };
    use std::path::Path;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// A matched checkbox line, borrowed from the scanned content.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskLine<'a> {
        /// Zero-based line index within the content.
        pub index: usize,
        pub indent: &'a str,
        pub marker: char,
        /// Everything after the checkbox, leading whitespace removed.
        pub text: &'a str,
        /// `"\r"` for CRLF content, otherwise empty.
        pub line_ending: &'a str,
    }

    impl TaskLine<'_> {
        pub fn is_checked(&self) -> bool {
            matches!(self.marker, 'x' | 'X')
        }
    }

    /// Every checkbox line of `content`, in order.
    pub fn scan_task_lines(content: &str) -> impl Iterator<Item = TaskLine<'_>> {
        content
            .split('\n')
            .enumerate()
            .filter_map(|(index, raw)| {
                let (line, line_ending) = match raw.strip_suffix('\r') {
                    Some(line) => (line, &raw[line.len()..]),
                    None => (raw, ""),
                };
                let (_, (indent, marker, text)) = checkbox_line(line).ok()?;
                Some(TaskLine {
                    index,
                    indent,
                    marker,
                    text,
                    line_ending,
                })
            })
    }

    /// Id of the task on zero-based line `index` of the file at `path`.
    pub fn task_id(path: &Path, index: usize) -> String {
        format!("{}-{}", file_stem(path), index)
    }

    /// Extracts the tasks of a frontmatter-free markdown body.
    pub fn extract_tasks(content: &str, path: &Path) -> Vec<TaskRecord> {
        let folder = parent_folder(path);
        let task_type = TaskType::from_folder(folder.as_deref());

        scan_task_lines(content)
            .map(|line| {
                let tokens = tokenize(line.text);
                TaskRecord {
                    id: task_id(path, line.index),
                    title: tokens.title,
                    completed: line.is_checked(),
                    status: tokens
                        .status
                        .unwrap_or_else(|| TaskStatus::from_marker(line.marker)),
                    line: line.index + 1,
                    file: path.to_path_buf(),
                    task_type,
                    folder: folder.clone(),
                    references: tokens.references,
                    metadata: tokens.metadata,
                }
            })
            .collect()
    }

    /// A whole source file: frontmatter split off, tasks taken from the body.
    #[derive(Debug, Clone, PartialEq)]
    pub struct ParsedFile {
        pub document: Document,
        pub tasks: Vec<TaskRecord>,
    }

    pub fn parse_document(path: &Path, text: &str) -> Result<ParsedFile, FrontmatterError> {
        let document = frontmatter::split(text)?;
        let tasks = extract_tasks(&document.body, path);
        Ok(ParsedFile { document, tasks })
    }

    fn checkbox_line(i: &str) -> PResult<'_, (&str, char, &str)> {
        let (i, indent) = take_while(|c: char| c.is_whitespace())(i)?;
        let (i, _) = char('-')(i)?;
        let (i, _) = take_while(|c: char| c.is_whitespace())(i)?;
        let (i, marker) = delimited(char('['), one_of(" xX~"), char(']'))(i)?;
        let (i, remainder) = verify(rest, |r: &str| !r.is_empty())(i)?;
        Ok((i, (indent, marker, remainder.trim_start())))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn extracts_flat_checklist() {
            let content = "- [ ] First task\n- [x] Completed task\n- [ ] Third task";
            let tasks = extract_tasks(content, Path::new("test.md"));
            assert_eq!(tasks.len(), 3);
            assert_eq!(
                tasks.iter().map(|t| t.completed).collect::<Vec<_>>(),
                vec![false, true, false]
            );
            assert_eq!(tasks.iter().map(|t| t.line).collect::<Vec<_>>(), vec![1, 2, 3]);
            assert_eq!(tasks[0].id, "test-0");
            assert_eq!(tasks[1].status, TaskStatus::Done);
            assert_eq!(tasks[2].title, "Third task");
        }

        #[test]
        fn nested_tasks_keep_line_positions() {
            let content = "# Plan\n\n- [ ] Parent\n    - [~] Child\n\t- [X] Tabbed";
            let tasks = extract_tasks(content, Path::new("plan.md"));
            assert_eq!(tasks.len(), 3);
            assert_eq!(tasks[1].id, "plan-3");
            assert_eq!(tasks[1].status, TaskStatus::InProgress);
            assert!(!tasks[1].completed);
            assert_eq!(tasks[2].line, 5);
            assert!(tasks[2].completed);
        }

        #[test]
        fn ignores_lines_that_are_not_dash_checkboxes() {
            let content = "1. [ ] numbered\n* [ ] star\n- plain bullet\n- [ ]\n- [?] odd\ntext - [ ] inline";
            assert!(extract_tasks(content, Path::new("x.md")).is_empty());
            assert!(extract_tasks("", Path::new("x.md")).is_empty());
        }

        #[test]
        fn tolerates_missing_spaces() {
            let tasks = extract_tasks("-[x]done already", Path::new("x.md"));
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].title, "done already");
        }

        #[test]
        fn crlf_lines_are_matched() {
            let lines: Vec<_> = scan_task_lines("- [ ] a\r\n- [x] b\r\n").collect();
            assert_eq!(lines.len(), 2);
            assert_eq!(lines[0].text, "a");
            assert_eq!(lines[0].line_ending, "\r");
        }

        #[test]
        fn folder_sets_type_for_every_task() {
            let tasks = extract_tasks(
                "- [ ] One (high) #api\n- [ ] Two ref:stories/s-1",
                Path::new("epics/epic-01.md"),
            );
            assert!(tasks.iter().all(|t| t.task_type == TaskType::Epic));
            assert!(tasks.iter().all(|t| t.folder.as_deref() == Some("epics")));
            let meta = tasks[0].metadata.as_ref().expect("metadata");
            assert_eq!(meta.priority, Some(Priority::High));
            assert_eq!(tasks[0].title, "One");
            assert_eq!(tasks[1].references.as_deref(), Some(&["stories/s-1".to_string()][..]));
            assert_eq!(tasks[1].id, "epic-01-1");
        }

        #[test]
        fn status_token_overrides_marker() {
            let tasks = extract_tasks("- [ ] Draft [doing]", Path::new("x.md"));
            assert_eq!(tasks[0].status, TaskStatus::InProgress);
            assert!(!tasks[0].completed);
            assert_eq!(tasks[0].title, "Draft");
        }

        #[test]
        fn document_lines_exclude_frontmatter() {
            let text = "---\ntitle: Demo\n---\n- [ ] After frontmatter\n";
            let parsed = parse_document(Path::new("demo.md"), text).expect("parse");
            assert_eq!(parsed.tasks.len(), 1);
            assert_eq!(parsed.tasks[0].line, 1);
            assert_eq!(parsed.tasks[0].id, "demo-0");
            assert_eq!(parsed.document.metadata["title"], "Demo");
        }
    }
}

pub mod grouping {
    //! Folds a flat task list into one group per source file.

    use crate::core::{FileLookup, TaskGroup, TaskRecord, TaskType, file_stem};
    use indexmap::IndexMap;
    use std::cmp::Ordering;

    /// `{folder}/{name}`, or `docs/{name}` for files outside any folder.
    pub fn group_id(folder: Option<&str>, name: &str) -> String {
        match folder {
            Some(folder) => format!("{folder}/{name}"),
            None => format!("docs/{name}"),
        }
    }

    /// Groups in order of first appearance, without filtering.
    pub fn fold_groups(tasks: &[TaskRecord], files: &FileLookup) -> Vec<TaskGroup> {
        let mut groups: IndexMap<String, TaskGroup> = IndexMap::new();

        for task in tasks {
            let name = file_stem(&task.file);
            let id = group_id(task.folder.as_deref(), &name);
            let group = groups.entry(id).or_insert_with_key(|id| {
                let entry = files.get(&task.file);
                TaskGroup {
                    id: id.clone(),
                    name,
                    group_type: task.task_type,
                    file: task.file.clone(),
                    folder: task.folder.clone(),
                    subtasks: Vec::new(),
                    total_tasks: 0,
                    completed_tasks: 0,
                    pending_tasks: 0,
                    content: entry.map(|e| e.content.clone()).unwrap_or_default(),
                    metadata: entry.map(|e| e.metadata.clone()).unwrap_or_default(),
                }
            });

            group.total_tasks += 1;
            if task.completed {
                group.completed_tasks += 1;
            } else {
                group.pending_tasks += 1;
            }
            group.subtasks.push(task.clone());
        }

        groups.into_values().collect()
    }

    /// Single-task files only surface when they are epics or docs.
    pub fn is_visible(group: &TaskGroup) -> bool {
        group.total_tasks > 1
            || group.group_type == TaskType::Epic
            || (group.group_type == TaskType::Doc && group.total_tasks > 0)
    }

    pub fn sort_groups(groups: &mut [TaskGroup]) {
        groups.sort_by(compare_groups);
    }

    /// Visible groups, epics first, then docs, stories and the rest; by name within a type.
    pub fn get_task_groups(tasks: &[TaskRecord], files: &FileLookup) -> Vec<TaskGroup> {
        let mut groups = fold_groups(tasks, files);
        groups.retain(is_visible);
        sort_groups(&mut groups);
        groups
    }

    fn compare_groups(a: &TaskGroup, b: &TaskGroup) -> Ordering {
        a.group_type
            .rank()
            .cmp(&b.group_type.rank())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::FileEntry;
        use crate::parser::extract_tasks;
        use serde_json::{Map, Value};
        use std::path::{Path, PathBuf};

        fn tasks_of(files: &[(&str, &str)]) -> Vec<TaskRecord> {
            files
                .iter()
                .flat_map(|(path, body)| extract_tasks(body, Path::new(path)))
                .collect()
        }

        #[test]
        fn single_custom_task_is_hidden_but_single_epic_is_shown() {
            let tasks = tasks_of(&[
                ("notes/one.md", "- [ ] lonely"),
                ("epics/big.md", "- [ ] only task"),
            ]);
            let groups = get_task_groups(&tasks, &FileLookup::new());
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].id, "epics/big");
        }

        #[test]
        fn single_doc_task_is_shown() {
            let tasks = tasks_of(&[("readme.md", "- [x] done")]);
            let groups = get_task_groups(&tasks, &FileLookup::new());
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].id, "docs/readme");
            assert_eq!(groups[0].group_type, TaskType::Doc);
        }

        #[test]
        fn counts_add_up() {
            let tasks = tasks_of(&[
                ("stories/s1.md", "- [ ] a\n- [x] b\n  - [~] c\n- [X] d"),
                ("bugs/b1.md", "- [ ] a\n- [ ] b"),
            ]);
            for group in fold_groups(&tasks, &FileLookup::new()) {
                assert_eq!(group.total_tasks, group.completed_tasks + group.pending_tasks);
                assert_eq!(group.total_tasks, group.subtasks.len());
                assert_eq!(
                    group.completed_tasks,
                    group.subtasks.iter().filter(|t| t.completed).count()
                );
            }
            let story = &fold_groups(&tasks, &FileLookup::new())[0];
            assert_eq!((story.completed_tasks, story.pending_tasks), (2, 2));
        }

        #[test]
        fn sorted_by_type_then_name() {
            let tasks = tasks_of(&[
                ("notes/zeta.md", "- [ ] a\n- [ ] b"),
                ("stories/Beta.md", "- [ ] a\n- [ ] b"),
                ("stories/alpha.md", "- [ ] a\n- [ ] b"),
                ("intro.md", "- [ ] a"),
                ("epics/e.md", "- [ ] a"),
            ]);
            let ids: Vec<_> = get_task_groups(&tasks, &FileLookup::new())
                .into_iter()
                .map(|g| g.id)
                .collect();
            assert_eq!(
                ids,
                vec![
                    "epics/e",
                    "docs/intro",
                    "stories/alpha",
                    "stories/Beta",
                    "notes/zeta"
                ]
            );
        }

        #[test]
        fn seeds_content_and_metadata_from_lookup() {
            let tasks = tasks_of(&[("epics/e.md", "- [ ] a\n- [ ] b")]);
            let mut metadata = Map::new();
            metadata.insert("title".into(), Value::String("Epic".into()));
            let mut files = FileLookup::new();
            files.insert(
                PathBuf::from("epics/e.md"),
                FileEntry {
                    content: "- [ ] a\n- [ ] b".into(),
                    metadata,
                },
            );
            let groups = get_task_groups(&tasks, &files);
            assert_eq!(groups[0].content, "- [ ] a\n- [ ] b");
            assert_eq!(groups[0].metadata["title"], "Epic");
            assert_eq!(groups[0].name, "e");
        }
    }
}

pub mod literal {
    //! `{key: value, ...}` metadata literals written by the metadata editor.
    //!
    //! A small recursive-descent grammar over JSON-like values: bare or quoted keys,
    //! single- or double-quoted strings, numbers, `true`/`false`/`null`, arrays and
    //! nested literals. Anything outside the grammar is rejected, never evaluated.

    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while},
        character::complete::{char, multispace0, satisfy},
        combinator::{map, map_opt, opt, recognize},
        error::{ErrorKind, ParseError, VerboseError, VerboseErrorKind},
        multi::separated_list0,
        number::complete::recognize_float,
        sequence::{delimited, pair, preceded, separated_pair, terminated},
    };
    use serde_json::{Number, Value};

    pub type Metadata = IndexMap<String, Value>;

    /// Deepest nesting of objects and arrays accepted in a literal.
    pub const MAX_DEPTH: usize = 32;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum LiteralError {
        #[error("malformed metadata literal near {near:?}")]
        Syntax { near: String },
        #[error("unexpected input after metadata literal: {0:?}")]
        Trailing(String),
        #[error("metadata literal nested deeper than {} levels", MAX_DEPTH)]
        TooDeep,
    }

    pub fn parse(src: &str) -> Result<Metadata, LiteralError> {
        match delimited(multispace0, |i| object(i, 0), multispace0)(src) {
            Ok(("", entries)) => Ok(entries),
            Ok((rest, _)) => Err(LiteralError::Trailing(rest.to_string())),
            Err(nom::Err::Failure(e)) if is_too_deep(&e) => Err(LiteralError::TooDeep),
            Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(LiteralError::Syntax {
                near: e
                    .errors
                    .first()
                    .map(|(frag, _)| frag.chars().take(24).collect())
                    .unwrap_or_default(),
            }),
            Err(nom::Err::Incomplete(_)) => Err(LiteralError::Syntax {
                near: String::new(),
            }),
        }
    }

    /// Renders `{key: "text", n: 3, tags: ["a", "b"]}`. Array items are always quoted.
    pub fn render(metadata: &Metadata) -> String {
        let body = metadata
            .iter()
            .map(|(key, value)| format!("{}: {}", render_key(key), render_value(value)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{{body}}}")
    }

    fn render_key(key: &str) -> String {
        if is_identifier(key) {
            key.to_string()
        } else {
            quote(key)
        }
    }

    fn render_value(value: &Value) -> String {
        match value {
            Value::String(text) => quote(text),
            Value::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| match item {
                        Value::String(text) => quote(text),
                        other => quote(&other.to_string()),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("[{items}]")
            }
            Value::Object(fields) => render(
                &fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Metadata>(),
            ),
            other => other.to_string(),
        }
    }

    fn quote(text: &str) -> String {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    }

    fn is_identifier(key: &str) -> bool {
        let mut chars = key.chars();
        chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    }

    /* ------------------------------- Grammar ------------------------------- */

    /// Fails hard once `depth` passes [`MAX_DEPTH`] so `alt` stops backtracking.
    fn enter(i: &str, depth: usize) -> PResult<'_, ()> {
        if depth > MAX_DEPTH {
            return Err(nom::Err::Failure(VerboseError::from_error_kind(
                i,
                ErrorKind::TooLarge,
            )));
        }
        Ok((i, ()))
    }

    fn is_too_deep(e: &VerboseError<&str>) -> bool {
        e.errors
            .iter()
            .any(|(_, kind)| matches!(kind, VerboseErrorKind::Nom(ErrorKind::TooLarge)))
    }

    fn object(i: &str, depth: usize) -> PResult<'_, Metadata> {
        let (i, _) = enter(i, depth)?;
        let (i, entries) = delimited(
            terminated(char('{'), multispace0),
            terminated(separated_list0(comma, |i| entry(i, depth)), opt(comma)),
            preceded(multispace0, char('}')),
        )(i)?;
        Ok((i, entries.into_iter().collect()))
    }

    fn array(i: &str, depth: usize) -> PResult<'_, Vec<Value>> {
        let (i, _) = enter(i, depth)?;
        delimited(
            terminated(char('['), multispace0),
            terminated(separated_list0(comma, |i| value(i, depth + 1)), opt(comma)),
            preceded(multispace0, char(']')),
        )(i)
    }

    fn comma(i: &str) -> PResult<'_, char> {
        delimited(multispace0, char(','), multispace0)(i)
    }

    fn entry(i: &str, depth: usize) -> PResult<'_, (String, Value)> {
        separated_pair(
            key,
            delimited(multispace0, char(':'), multispace0),
            |i| value(i, depth + 1),
        )(i)
    }

    fn key(i: &str) -> PResult<'_, String> {
        alt((quoted, map(identifier, str::to_string)))(i)
    }

    fn identifier(i: &str) -> PResult<'_, &str> {
        recognize(pair(
            satisfy(|c| c.is_ascii_alphabetic() || c == '_' || c == '$'),
            take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '$'),
        ))(i)
    }

    fn value(i: &str, depth: usize) -> PResult<'_, Value> {
        alt((
            map(quoted, Value::String),
            map(
                |i| object(i, depth),
                |fields| Value::Object(fields.into_iter().collect()),
            ),
            map(|i| array(i, depth), Value::Array),
            map(tag("true"), |_| Value::Bool(true)),
            map(tag("false"), |_| Value::Bool(false)),
            map(tag("null"), |_| Value::Null),
            map_opt(recognize_float, number),
        ))(i)
    }

    fn number(text: &str) -> Option<Value> {
        if let Ok(int) = text.parse::<i64>() {
            return Some(Value::Number(int.into()));
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
    }

    fn quoted(i: &str) -> PResult<'_, String> {
        let (body, quote) = alt((char('"'), char('\'')))(i)?;
        let mut out = String::new();
        let mut chars = body.char_indices();
        while let Some((at, c)) = chars.next() {
            match c {
                c if c == quote => return Ok((&body[at + c.len_utf8()..], out)),
                '\\' => match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(nom::Err::Error(VerboseError::from_error_kind(
            i,
            ErrorKind::Char,
        )))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn parses_bare_and_quoted_keys() {
            let parsed = parse(r#"{priority: "high", 'due': '2024-01-15', "x-y": 3}"#)
                .expect("parse");
            assert_eq!(parsed["priority"], json!("high"));
            assert_eq!(parsed["due"], json!("2024-01-15"));
            assert_eq!(parsed["x-y"], json!(3));
            assert_eq!(
                parsed.keys().collect::<Vec<_>>(),
                vec!["priority", "due", "x-y"]
            );
        }

        #[test]
        fn parses_arrays_numbers_and_keywords() {
            let parsed = parse("{ tags: ['a', \"b\",], estimate: 1.5, done: false, owner: null, }")
                .expect("parse");
            assert_eq!(parsed["tags"], json!(["a", "b"]));
            assert_eq!(parsed["estimate"], json!(1.5));
            assert_eq!(parsed["done"], json!(false));
            assert_eq!(parsed["owner"], Value::Null);
            assert!(parse("{}").expect("empty").is_empty());
        }

        #[test]
        fn parses_nested_literals_and_escapes() {
            let parsed = parse(r#"{links: {design: "a \"b\""}}"#).expect("parse");
            assert_eq!(parsed["links"], json!({"design": "a \"b\""}));
        }

        #[test]
        fn rejects_malformed_input() {
            assert!(matches!(parse("{priority: }"), Err(LiteralError::Syntax { .. })));
            assert!(parse("{priority: high}").is_err());
            assert!(parse("{a: 1").is_err());
            assert!(parse("{a: 'open}").is_err());
            assert!(matches!(parse("{a: 1} extra"), Err(LiteralError::Trailing(_))));
            assert!(parse("{a: alert(1)}").is_err());
        }

        fn nested(depth: usize) -> String {
            format!("{}1{}", "{a:".repeat(depth), "}".repeat(depth))
        }

        #[test]
        fn nesting_is_bounded() {
            assert!(parse(&nested(MAX_DEPTH)).is_ok());
            assert_eq!(parse(&nested(MAX_DEPTH + 8)), Err(LiteralError::TooDeep));
            assert_eq!(parse(&nested(10_000)), Err(LiteralError::TooDeep));

            let arrays = format!("{{a: {}{}}}", "[".repeat(10_000), "]".repeat(10_000));
            assert_eq!(parse(&arrays), Err(LiteralError::TooDeep));
        }

        #[test]
        fn renders_strings_quoted_and_arrays_bracketed() {
            let mut meta = Metadata::new();
            meta.insert("priority".into(), json!("high"));
            meta.insert("tags".into(), json!(["a", 2]));
            meta.insert("points".into(), json!(3));
            meta.insert("blocked".into(), json!(true));
            meta.insert("needs space".into(), json!("say \"hi\""));
            let rendered = render(&meta);
            assert_eq!(
                rendered,
                r#"{priority: "high", tags: ["a", "2"], points: 3, blocked: true, "needs space": "say \"hi\""}"#
            );
            let reparsed = parse(&rendered).expect("reparse");
            assert_eq!(reparsed["needs space"], json!("say \"hi\""));
            assert_eq!(reparsed["tags"], json!(["a", "2"]));
        }
    }
}

pub mod serializer {
    //! Rewrites one task line in place.
    //!
    //! Two metadata encodings coexist on a task line: the inline `#tag @due +who`
    //! tokens read by the tokenizer, and a trailing `{key: value}` literal kept by the
    //! metadata editor. Updates only ever touch the literal; inline tokens stay
    //! verbatim in the title text.

    use crate::core::TaskStatus;
    use crate::literal::{self, LiteralError, Metadata};
    use crate::parser::{self, TaskLine};
    use crate::tokenizer::strip_status_tokens;
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};
    use std::path::Path;
    use tracing::{debug, warn};

    /// Partial change to one task. `null` metadata values delete the key.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct TaskUpdate {
        #[serde(default)]
        pub status: Option<TaskStatus>,
        #[serde(default)]
        pub metadata: Option<Map<String, Value>>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct UpdateOutcome {
        pub updated_content: String,
        pub found: bool,
    }

    /// Applies `update` to the task `subtask_id` of the body `content` read from `path`.
    ///
    /// Lines other than the target come back byte-for-byte. When no line carries the
    /// id, `found` is false and the content is returned unchanged.
    pub fn apply_update(
        content: &str,
        path: &Path,
        subtask_id: &str,
        update: &TaskUpdate,
    ) -> UpdateOutcome {
        let Some(target) =
            parser::scan_task_lines(content).find(|line| parser::task_id(path, line.index) == subtask_id)
        else {
            debug!(subtask_id, file = %path.display(), "no task line carries this id");
            return UpdateOutcome {
                updated_content: content.to_string(),
                found: false,
            };
        };

        let replacement = rewrite_line(&target, update);
        let updated_content = content
            .split('\n')
            .enumerate()
            .map(|(index, line)| {
                if index == target.index {
                    replacement.as_str()
                } else {
                    line
                }
            })
            .collect::<Vec<_>>()
            .join("\n");

        UpdateOutcome {
            updated_content,
            found: true,
        }
    }

    fn rewrite_line(line: &TaskLine<'_>, update: &TaskUpdate) -> String {
        let checkbox = match update.status {
            Some(status) => status.checkbox().to_string(),
            None => format!("[{}]", line.marker),
        };

        let title = line.text.trim_end();
        if update.status.is_none() && update.metadata.is_none() {
            return format!("{}- {} {}{}", line.indent, checkbox, title, line.line_ending);
        }

        let (clean, existing) = split_metadata_suffix(title);
        let gap = existing
            .raw()
            .map_or("", |raw| &title[clean.len()..title.len() - raw.len()]);
        // An explicit status token would override the new checkbox on the next read.
        // The literal is left alone: its strings are stored values, not title text.
        let clean = match update.status {
            Some(_) => strip_status_tokens(clean),
            None => clean.to_string(),
        };
        let suffix = match &update.metadata {
            Some(patch) => {
                let merged = merge_metadata(existing, patch);
                (!merged.is_empty()).then(|| (" ", literal::render(&merged)))
            }
            None => existing.raw().map(|raw| (gap, raw.to_string())),
        };
        let title = match suffix {
            None => clean,
            Some((_, suffix)) if clean.is_empty() => suffix,
            Some((gap, suffix)) => format!("{clean}{gap}{suffix}"),
        };

        format!("{}- {} {}{}", line.indent, checkbox, title, line.line_ending)
    }

    enum Existing<'a> {
        Absent,
        Parsed { raw: &'a str, fields: Metadata },
        Malformed { raw: &'a str, error: LiteralError },
    }

    impl<'a> Existing<'a> {
        fn raw(&self) -> Option<&'a str> {
            match self {
                Self::Absent => None,
                Self::Parsed { raw, .. } | Self::Malformed { raw, .. } => Some(*raw),
            }
        }
    }

    /// Splits a title into its text and a trailing `{...}` literal. The leftmost
    /// brace that starts a well-formed literal wins; if none parses, the last
    /// brace-to-end span is treated as a malformed literal.
    fn split_metadata_suffix(title: &str) -> (&str, Existing<'_>) {
        let mut last_error = None;
        for (at, _) in title.match_indices('{') {
            let tail = &title[at..];
            if !tail.ends_with('}') {
                continue;
            }
            match literal::parse(tail) {
                Ok(fields) => {
                    return (
                        title[..at].trim_end(),
                        Existing::Parsed { raw: tail, fields },
                    );
                }
                Err(error) => last_error = Some((at, error)),
            }
        }
        match last_error {
            Some((at, error)) => (
                title[..at].trim_end(),
                Existing::Malformed {
                    raw: &title[at..],
                    error,
                },
            ),
            None => (title, Existing::Absent),
        }
    }

    fn merge_metadata(existing: Existing<'_>, patch: &Map<String, Value>) -> Metadata {
        let mut merged = match existing {
            Existing::Absent => Metadata::new(),
            Existing::Parsed { fields, .. } => fields,
            Existing::Malformed { raw, error } => {
                warn!(literal = raw, %error, "replacing unreadable metadata literal");
                Metadata::new()
            }
        };
        for (key, value) in patch {
            merged.insert(key.clone(), value.clone());
        }
        merged.retain(|_, value| !value.is_null());
        merged
    }

}

pub mod frontmatter {
    //! YAML frontmatter at the top of a markdown file.
    //!
    //! The raw block is kept so that writing a document back reproduces it exactly;
    //! YAML is only rendered for documents that never had a block.

    use serde_json::{Map, Value};
    use tracing::debug;

    const FENCE: &str = "---";

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Document {
        /// Opening fence through closing fence line, newline included.
        pub raw: Option<String>,
        pub metadata: Map<String, Value>,
        pub body: String,
    }

    impl Document {
        pub fn with_metadata(metadata: Map<String, Value>, body: impl Into<String>) -> Self {
            Self {
                raw: None,
                metadata,
                body: body.into(),
            }
        }

        fn plain(text: &str) -> Self {
            Self {
                raw: None,
                metadata: Map::new(),
                body: text.to_string(),
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum FrontmatterError {
        /// Also raised for non-string keys such as `1: a`, which JSON metadata cannot hold.
        #[error("frontmatter is not valid YAML or has a non-string key: {0}")]
        Yaml(#[from] serde_yaml::Error),
        #[error("frontmatter must be a mapping, found {0}")]
        NotAMapping(&'static str),
    }

    pub fn split(text: &str) -> Result<Document, FrontmatterError> {
        let Some(first) = text.split_inclusive('\n').next() else {
            return Ok(Document::plain(text));
        };
        if first.trim_end_matches(['\r', '\n']) != FENCE || !first.ends_with('\n') {
            return Ok(Document::plain(text));
        }

        let mut offset = first.len();
        for line in text[first.len()..].split_inclusive('\n') {
            if line.trim_end_matches(['\r', '\n']) == FENCE {
                let yaml = &text[first.len()..offset];
                let end = offset + line.len();
                return Ok(Document {
                    raw: Some(text[..end].to_string()),
                    metadata: parse_yaml(yaml)?,
                    body: text[end..].to_string(),
                });
            }
            offset += line.len();
        }

        debug!("opening frontmatter fence has no closing fence; reading as body");
        Ok(Document::plain(text))
    }

    pub fn join(document: &Document) -> Result<String, FrontmatterError> {
        match &document.raw {
            Some(raw) => Ok(format!("{raw}{}", document.body)),
            None if document.metadata.is_empty() => Ok(document.body.clone()),
            None => {
                let yaml = serde_yaml::to_string(&document.metadata)?;
                Ok(format!("{FENCE}\n{yaml}{FENCE}\n{}", document.body))
            }
        }
    }

    fn parse_yaml(yaml: &str) -> Result<Map<String, Value>, FrontmatterError> {
        if yaml.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_yaml::from_str::<Value>(yaml)? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            Value::Array(_) => Err(FrontmatterError::NotAMapping("a sequence")),
            _ => Err(FrontmatterError::NotAMapping("a scalar")),
        }
    }

}

pub mod config {
    //! Store configuration.
    //!
    //! Loading flow:
    //! 1. Compiled [`StoreConfig::default()`]
    //! 2. `taskdoc.json` (or an explicit path) deep-merged over the defaults
    //! 3. `TASKDOC_ROOT` / `TASKDOC_MAX_DEPTH` environment overrides

    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    pub const CONFIG_FILE: &str = "taskdoc.json";
    pub const ENV_ROOT: &str = "TASKDOC_ROOT";
    pub const ENV_MAX_DEPTH: &str = "TASKDOC_MAX_DEPTH";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct StoreConfig {
        /// Directory holding the task files.
        pub root: PathBuf,
        /// File extensions read as task files, without the dot.
        pub extensions: Vec<String>,
        /// Deepest directory level visited while scanning or searching.
        pub max_depth: usize,
        /// Directory names skipped while scanning.
        pub ignore: Vec<String>,
    }

    impl Default for StoreConfig {
        fn default() -> Self {
            Self {
                root: PathBuf::from("docs"),
                extensions: vec!["md".into(), "mdx".into()],
                max_depth: 8,
                ignore: vec![".git".into(), "node_modules".into(), ".next".into()],
            }
        }
    }

    impl StoreConfig {
        pub fn with_root(root: impl Into<PathBuf>) -> Self {
            Self {
                root: root.into(),
                ..Self::default()
            }
        }

        /// Whether `path` has one of the configured extensions.
        pub fn accepts(&self, path: &Path) -> bool {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| self.extensions.iter().any(|known| known == ext))
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("reading config {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("config {path:?} is not valid JSON")]
        Json {
            path: PathBuf,
            #[source]
            source: serde_json::Error,
        },
        #[error("config has an unexpected shape")]
        Shape(#[from] serde_json::Error),
        #[error("environment variable {key} has invalid value {value:?}")]
        InvalidEnv { key: &'static str, value: String },
    }

    pub fn load_config(explicit: Option<&Path>) -> Result<StoreConfig, ConfigError> {
        load_config_with_env(explicit, |key| std::env::var(key).ok())
    }

    /// Like [`load_config`], reading environment values through `env`.
    pub fn load_config_with_env(
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<StoreConfig, ConfigError> {
        let defaults = serde_json::to_value(StoreConfig::default())?;
        let path = explicit.map_or_else(|| PathBuf::from(CONFIG_FILE), Path::to_path_buf);

        let merged = if explicit.is_some() || path.exists() {
            debug!(?path, "loading config file");
            let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let user: Value = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
                path: path.clone(),
                source,
            })?;
            deep_merge(defaults, user)
        } else {
            debug!(?path, "no config file, using defaults");
            defaults
        };

        let mut config: StoreConfig = serde_json::from_value(merged)?;
        apply_env_overrides(&mut config, env)?;
        Ok(config)
    }

    /// Objects merge per key, everything else is replaced; nulls in `source` are skipped.
    pub fn deep_merge(target: Value, source: Value) -> Value {
        match (target, source) {
            (Value::Object(mut target_map), Value::Object(source_map)) => {
                for (key, source_val) in source_map {
                    if source_val.is_null() {
                        continue;
                    }
                    let merged = match target_map.remove(&key) {
                        Some(target_val) => deep_merge(target_val, source_val),
                        None => source_val,
                    };
                    target_map.insert(key, merged);
                }
                Value::Object(target_map)
            }
            (_, source) => source,
        }
    }

    fn apply_env_overrides(
        config: &mut StoreConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(root) = env(ENV_ROOT).filter(|v| !v.is_empty()) {
            config.root = PathBuf::from(root);
        }
        if let Some(depth) = env(ENV_MAX_DEPTH) {
            config.max_depth = depth.parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_MAX_DEPTH,
                value: depth.clone(),
            })?;
        }
        Ok(())
    }

}

pub mod workspace {
    //! Filesystem side of the task store: scanning the content root, locating a
    //! group's file, and the locked read-modify-write cycle of an update.
    //!
    //! - Paths handed to the core are root-relative ("logical") so that folder and
    //!   type come out the same wherever the root lives on disk.
    //! - The scanned manifest is cached per store and dropped after every write.
    //! - Updates to one file are serialised through a path-keyed mutex and written
    //!   through a temp file renamed over the original.

    use crate::config::StoreConfig;
    use crate::core::{FileEntry, FileLookup, TaskGroup, TaskRecord, file_stem, parent_folder};
    use crate::frontmatter::{self, Document, FrontmatterError};
    use crate::grouping;
    use crate::parser;
    use crate::serializer::{self, TaskUpdate};
    use parking_lot::{Mutex, RwLock};
    use std::{
        collections::HashMap,
        fs,
        io::Write,
        path::{Component, Path, PathBuf},
        sync::Arc,
    };
    use tracing::{debug, info, warn};
    use walkdir::{DirEntry, WalkDir};

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("no task file found for {id:?}")]
        NotFound { id: String },
        #[error("task {subtask:?} not found in {file:?}")]
        TaskNotFound { file: PathBuf, subtask: String },
        #[error("I/O error on {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("invalid frontmatter in {path:?}")]
        Frontmatter {
            path: PathBuf,
            #[source]
            source: FrontmatterError,
        },
        #[error("scanning {root:?}")]
        Walk {
            root: PathBuf,
            #[source]
            source: walkdir::Error,
        },
    }

    impl StoreError {
        /// HTTP status an API layer should answer with.
        pub fn status_code(&self) -> u16 {
            match self {
                Self::NotFound { .. } | Self::TaskNotFound { .. } => 404,
                _ => 500,
            }
        }
    }

    /// A task file read from disk.
    #[derive(Debug, Clone, PartialEq)]
    pub struct TaskFile {
        pub path: PathBuf,
        pub logical_path: PathBuf,
        pub document: Document,
        pub tasks: Vec<TaskRecord>,
    }

    /// Snapshot of every task file under the root.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Manifest {
        pub files: Vec<TaskFile>,
    }

    impl Manifest {
        pub fn tasks(&self) -> Vec<TaskRecord> {
            self.files.iter().flat_map(|f| f.tasks.iter().cloned()).collect()
        }

        pub fn lookup(&self) -> FileLookup {
            self.files
                .iter()
                .map(|f| {
                    (
                        f.logical_path.clone(),
                        FileEntry {
                            content: f.document.body.clone(),
                            metadata: f.document.metadata.clone(),
                        },
                    )
                })
                .collect()
        }

        /// Visible groups, sorted for display.
        pub fn groups(&self) -> Vec<TaskGroup> {
            grouping::get_task_groups(&self.tasks(), &self.lookup())
        }

        /// Every group, including single-task files the visible view hides.
        pub fn all_groups(&self) -> Vec<TaskGroup> {
            let mut groups = grouping::fold_groups(&self.tasks(), &self.lookup());
            grouping::sort_groups(&mut groups);
            groups
        }

        pub fn groups_for(&self, include_hidden: bool) -> Vec<TaskGroup> {
            if include_hidden {
                self.all_groups()
            } else {
                self.groups()
            }
        }
    }

    /// Result of an update: the file touched and its full new text.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct UpdateReport {
        pub path: PathBuf,
        pub content: String,
        pub written: bool,
    }

    pub struct TaskStore {
        config: StoreConfig,
        cache: RwLock<ManifestCache>,
        locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    }

    /// `generation` moves on every invalidation; a scan started under an older
    /// generation may have read files that have since been rewritten.
    #[derive(Default)]
    struct ManifestCache {
        generation: u64,
        manifest: Option<Arc<Manifest>>,
    }

    impl TaskStore {
        pub fn new(config: StoreConfig) -> Self {
            Self {
                config,
                cache: RwLock::new(ManifestCache::default()),
                locks: Mutex::new(HashMap::new()),
            }
        }

        pub fn config(&self) -> &StoreConfig {
            &self.config
        }

        /* ----------------------------- Reading ----------------------------- */

        /// Cached manifest, scanning the root on first use or after invalidation.
        pub fn manifest(&self) -> Result<Arc<Manifest>, StoreError> {
            let generation = {
                let cache = self.cache.read();
                if let Some(cached) = &cache.manifest {
                    return Ok(Arc::clone(cached));
                }
                cache.generation
            };
            let fresh = Arc::new(self.scan()?);
            self.store_if_current(generation, &fresh);
            Ok(fresh)
        }

        pub fn invalidate(&self) {
            let mut cache = self.cache.write();
            cache.generation += 1;
            cache.manifest = None;
        }

        fn store_if_current(&self, generation: u64, fresh: &Arc<Manifest>) {
            let mut cache = self.cache.write();
            if cache.generation == generation {
                cache.manifest = Some(Arc::clone(fresh));
            } else {
                debug!("discarding scan overtaken by a write");
            }
        }

        pub fn task_groups(&self) -> Result<Vec<TaskGroup>, StoreError> {
            Ok(self.manifest()?.groups())
        }

        /// Reads every task file under the root. Files with unreadable frontmatter are skipped.
        pub fn scan(&self) -> Result<Manifest, StoreError> {
            let root = &self.config.root;
            debug!(?root, "scanning task files");
            let mut files = Vec::new();

            let walker = WalkDir::new(root)
                .max_depth(self.config.max_depth)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !self.is_ignored(e));
            for entry in walker {
                let entry = entry.map_err(|source| StoreError::Walk {
                    root: root.clone(),
                    source,
                })?;
                if !entry.file_type().is_file() || !self.config.accepts(entry.path()) {
                    continue;
                }
                match self.load(entry.path()) {
                    Ok(file) => files.push(file),
                    Err(StoreError::Frontmatter { path, source }) => {
                        warn!(
                            ?path,
                            error = %source,
                            "skipping task file with unreadable frontmatter"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }

            debug!(files = files.len(), "scan complete");
            Ok(Manifest { files })
        }

        /// Reads and parses one file below the root.
        pub fn load(&self, path: &Path) -> Result<TaskFile, StoreError> {
            let text = fs::read_to_string(path).map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let logical_path = self.logical_path(path);
            let parsed = parser::parse_document(&logical_path, &text).map_err(|source| {
                StoreError::Frontmatter {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            Ok(TaskFile {
                path: path.to_path_buf(),
                logical_path,
                document: parsed.document,
                tasks: parsed.tasks,
            })
        }

        /* ----------------------------- Locating ----------------------------- */

        /// Resolves a group id (`folder/name` or `docs/name`) to a file on disk.
        ///
        /// Tries `<root>/<folder>/<name>.<ext>` for each extension first (for `docs`
        /// also `<root>/<name>.<ext>`), then searches the tree down to `max_depth`.
        pub fn locate(&self, group_id: &str) -> Result<PathBuf, StoreError> {
            let not_found = || StoreError::NotFound {
                id: group_id.to_string(),
            };
            let escapes_root = Path::new(group_id)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
            if group_id.is_empty() || escapes_root {
                return Err(not_found());
            }

            let (folder, name) = match group_id.rsplit_once('/') {
                Some((folder, name)) => (Some(folder), name),
                None => (None, group_id),
            };
            let name = self.without_extension(name);

            for candidate in self.direct_candidates(folder, name) {
                if candidate.is_file() {
                    debug!(group_id, path = ?candidate, "located task file");
                    return Ok(candidate);
                }
            }
            self.search(folder, name).ok_or_else(not_found)
        }

        fn direct_candidates(&self, folder: Option<&str>, name: &str) -> Vec<PathBuf> {
            let root = &self.config.root;
            let dirs = match folder {
                Some("docs") => vec![root.join("docs"), root.clone()],
                Some(folder) => vec![root.join(folder)],
                None => vec![root.clone()],
            };
            dirs.iter()
                .flat_map(|dir| {
                    self.config
                        .extensions
                        .iter()
                        .map(move |ext| dir.join(format!("{name}.{ext}")))
                })
                .collect()
        }

        fn search(&self, folder: Option<&str>, name: &str) -> Option<PathBuf> {
            let wanted_folder = folder
                .filter(|f| *f != "docs")
                .map(|f| f.rsplit('/').next().unwrap_or(f));
            WalkDir::new(&self.config.root)
                .max_depth(self.config.max_depth)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !self.is_ignored(e))
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file() && self.config.accepts(e.path()))
                .find(|e| {
                    file_stem(e.path()) == name
                        && wanted_folder.is_none_or(|f| parent_folder(e.path()).as_deref() == Some(f))
                })
                .map(DirEntry::into_path)
        }

        fn without_extension<'a>(&self, name: &'a str) -> &'a str {
            match name.rsplit_once('.') {
                Some((stem, ext)) if self.config.extensions.iter().any(|e| e == ext) => stem,
                _ => name,
            }
        }

        fn is_ignored(&self, entry: &DirEntry) -> bool {
            entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| self.config.ignore.iter().any(|i| i == name))
        }

        /// `path` relative to the root, or unchanged when it lies outside it.
        pub fn logical_path(&self, path: &Path) -> PathBuf {
            path.strip_prefix(&self.config.root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.to_path_buf())
        }

        /* ----------------------------- Writing ----------------------------- */

        /// Applies `update` to one task and writes the file back.
        pub fn update_task(
            &self,
            group_id: &str,
            subtask_id: &str,
            update: &TaskUpdate,
        ) -> Result<UpdateReport, StoreError> {
            self.apply(group_id, subtask_id, update, true)
        }

        /// Computes the updated file text without writing it.
        pub fn preview_update(
            &self,
            group_id: &str,
            subtask_id: &str,
            update: &TaskUpdate,
        ) -> Result<UpdateReport, StoreError> {
            self.apply(group_id, subtask_id, update, false)
        }

        fn apply(
            &self,
            group_id: &str,
            subtask_id: &str,
            update: &TaskUpdate,
            write: bool,
        ) -> Result<UpdateReport, StoreError> {
            let path = self.locate(group_id)?;
            let lock = self.lock_for(&path);
            let _guard = lock.lock();

            let file = self.load(&path)?;
            let outcome =
                serializer::apply_update(&file.document.body, &file.logical_path, subtask_id, update);
            if !outcome.found {
                return Err(StoreError::TaskNotFound {
                    file: path,
                    subtask: subtask_id.to_string(),
                });
            }

            let document = Document {
                body: outcome.updated_content,
                ..file.document
            };
            let content = frontmatter::join(&document).map_err(|source| StoreError::Frontmatter {
                path: path.clone(),
                source,
            })?;

            if write {
                write_atomic(&path, &content)?;
                self.invalidate();
                info!(group_id, subtask_id, path = ?path, "task updated");
            }
            Ok(UpdateReport {
                path,
                content,
                written: write,
            })
        }

        fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(path.to_path_buf()).or_default())
        }
    }

    fn write_atomic(path: &Path, text: &str) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(text.as_bytes()).map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

}

pub mod api {
    //! JSON shapes of the task PATCH endpoint, independent of any HTTP framework.

    use crate::core::TaskStatus;
    use crate::serializer::TaskUpdate;
    use crate::workspace::{StoreError, TaskStore};
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value, json};
    use tracing::error;

    /// Body of `PATCH /tasks/{group}/{subtask}`.
    #[derive(Debug, Clone, Default, PartialEq, Deserialize)]
    pub struct PatchRequest {
        #[serde(default)]
        pub status: Option<String>,
        #[serde(default)]
        pub metadata: Option<Map<String, Value>>,
    }

    impl PatchRequest {
        pub fn to_update(&self) -> TaskUpdate {
            TaskUpdate {
                status: self.status.as_deref().map(TaskStatus::from_request),
                metadata: self.metadata.clone(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PatchResponse {
        pub success: bool,
        pub message: String,
        pub file_path: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ErrorResponse {
        pub error: String,
        pub details: String,
    }

    /// Status code plus JSON body.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Reply {
        pub status: u16,
        pub body: Value,
    }

    pub fn patch_task(
        store: &TaskStore,
        group_id: &str,
        subtask_id: &str,
        request: &PatchRequest,
    ) -> Reply {
        match store.update_task(group_id, subtask_id, &request.to_update()) {
            Ok(report) => Reply {
                status: 200,
                body: json!(PatchResponse {
                    success: true,
                    message: "Task updated successfully".into(),
                    file_path: report.path.display().to_string(),
                }),
            },
            Err(err) => failure(&err, "Failed to update task"),
        }
    }

    /// Visible task groups, or all of them with `include_hidden`.
    pub fn list_groups(store: &TaskStore, include_hidden: bool) -> Reply {
        match store.manifest().map(|manifest| manifest.groups_for(include_hidden)) {
            Ok(groups) => Reply {
                status: 200,
                body: json!(groups),
            },
            Err(err) => failure(&err, "Failed to load tasks"),
        }
    }

    fn failure(err: &StoreError, context: &str) -> Reply {
        let status = err.status_code();
        let error = if status == 404 {
            "Task not found".to_string()
        } else {
            error!(error = %err, "{context}");
            context.to_string()
        };
        Reply {
            status,
            body: json!(ErrorResponse {
                error,
                details: err.to_string(),
            }),
        }
    }

}
