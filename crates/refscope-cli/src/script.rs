//! Line-oriented ref scripts.
//!
//! Each non-blank line that does not start with `#` is one step:
//!
//! ```text
//! init
//! update refs/heads/main @first - initial import
//! symref HEAD refs/heads/main checkout main
//! begin
//! update --no-deref HEAD @detached
//! delete-ref refs/heads/old
//! commit
//! reflog refs/heads/main --reverse --max 5
//! ```
//!
//! Object ids are written as 64 hex digits, `null`, or `@text` (the hash of
//! `text`). In an expected-old-value position `-` means "no expectation".

use anyhow::{anyhow, bail, Context};
use refscope_refs::{ExpireFlags, PackFlags, UpdateFlags};
use refscope_types::ObjectId;

/// One parsed script line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Init,
    Begin,
    Update {
        name: String,
        new: ObjectId,
        old: Option<ObjectId>,
        flags: UpdateFlags,
        message: String,
    },
    DeleteRef {
        name: String,
        old: Option<ObjectId>,
        flags: UpdateFlags,
        message: String,
    },
    Commit,
    Abort,
    InitialCommit,
    Symref {
        name: String,
        target: String,
        message: String,
    },
    Delete {
        names: Vec<String>,
    },
    Rename {
        old: String,
        new: String,
        message: String,
    },
    Copy {
        old: String,
        new: String,
        message: String,
    },
    PseudoWrite {
        name: String,
        new: ObjectId,
        old: Option<ObjectId>,
    },
    PseudoDelete {
        name: String,
        old: Option<ObjectId>,
    },
    Resolve {
        name: String,
    },
    List {
        prefix: String,
        include_broken: bool,
    },
    Reflog {
        name: String,
        reverse: bool,
        max: Option<usize>,
    },
    Reflogs,
    ReflogExists {
        name: String,
    },
    ReflogCreate {
        name: String,
        force: bool,
    },
    ReflogDelete {
        name: String,
    },
    Expire {
        name: String,
        before: i64,
        flags: ExpireFlags,
    },
    Pack {
        flags: PackFlags,
    },
}

/// A step together with the line it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Line {
    pub number: usize,
    pub text: String,
    pub step: Step,
}

/// Parse a whole script.
pub fn parse_script(source: &str) -> anyhow::Result<Vec<Line>> {
    let mut lines = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let text = raw.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let step = parse_line(text).with_context(|| format!("line {}: {text}", idx + 1))?;
        lines.push(Line {
            number: idx + 1,
            text: text.to_string(),
            step,
        });
    }
    Ok(lines)
}

/// Parse an object id: 64 hex digits, `null`, or `@text`.
pub fn parse_oid(token: &str) -> anyhow::Result<ObjectId> {
    if token == "null" {
        return Ok(ObjectId::null());
    }
    if let Some(seed) = token.strip_prefix('@') {
        return Ok(ObjectId::from_bytes(seed.as_bytes()));
    }
    ObjectId::from_hex(token).map_err(|e| anyhow!("bad object id {token:?}: {e}"))
}

fn looks_like_oid(token: &str) -> bool {
    token == "-" || token == "null" || token.starts_with('@') || ObjectId::from_hex(token).is_ok()
}

fn parse_expected(token: &str) -> anyhow::Result<Option<ObjectId>> {
    if token == "-" {
        Ok(None)
    } else {
        parse_oid(token).map(Some)
    }
}

/// Splits a line into words while leaving the trailing message intact.
struct Words<'a> {
    rest: &'a str,
}

impl<'a> Words<'a> {
    fn new(text: &'a str) -> Self {
        Self { rest: text.trim() }
    }

    fn peek(&self) -> Option<&'a str> {
        self.rest.split_whitespace().next()
    }

    fn next(&mut self) -> Option<&'a str> {
        let word = self.peek()?;
        let start = self.rest.find(word).unwrap_or(0);
        self.rest = self.rest[start + word.len()..].trim_start();
        Some(word)
    }

    fn required(&mut self, what: &str) -> anyhow::Result<&'a str> {
        self.next().ok_or_else(|| anyhow!("missing {what}"))
    }

    /// Consume `--flag` if it is the next word.
    fn flag(&mut self, name: &str) -> bool {
        if self.peek() == Some(name) {
            self.next();
            true
        } else {
            false
        }
    }

    /// Everything left, with one pair of surrounding double quotes removed.
    fn message(self) -> String {
        let rest = self.rest.trim();
        rest.strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .unwrap_or(rest)
            .to_string()
    }

    fn finish(self) -> anyhow::Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(word) => bail!("unexpected argument {word:?}"),
        }
    }
}

fn update_flags(words: &mut Words<'_>) -> UpdateFlags {
    let mut flags = UpdateFlags::empty();
    loop {
        if words.flag("--no-deref") {
            flags |= UpdateFlags::NO_DEREF;
        } else if words.flag("--create-reflog") {
            flags |= UpdateFlags::FORCE_CREATE_REFLOG;
        } else {
            return flags;
        }
    }
}

fn optional_old(words: &mut Words<'_>) -> anyhow::Result<Option<ObjectId>> {
    match words.peek() {
        Some(token) if looks_like_oid(token) => {
            words.next();
            parse_expected(token)
        }
        _ => Ok(None),
    }
}

fn parse_line(text: &str) -> anyhow::Result<Step> {
    let mut words = Words::new(text);
    let command = words.required("command")?;
    let step = match command {
        "init" => Step::Init,
        "begin" => Step::Begin,
        "commit" => Step::Commit,
        "abort" => Step::Abort,
        "initial-commit" => Step::InitialCommit,
        "reflogs" => Step::Reflogs,
        "update" => {
            let flags = update_flags(&mut words);
            let name = words.required("ref name")?.to_string();
            let new = parse_oid(words.required("new value")?)?;
            let old = optional_old(&mut words)?;
            return Ok(Step::Update {
                name,
                new,
                old,
                flags,
                message: words.message(),
            });
        }
        "delete-ref" => {
            let flags = update_flags(&mut words);
            let name = words.required("ref name")?.to_string();
            let old = optional_old(&mut words)?;
            return Ok(Step::DeleteRef {
                name,
                old,
                flags,
                message: words.message(),
            });
        }
        "symref" => {
            let name = words.required("ref name")?.to_string();
            let target = words.required("target")?.to_string();
            return Ok(Step::Symref {
                name,
                target,
                message: words.message(),
            });
        }
        "delete" => {
            let mut names = Vec::new();
            while let Some(name) = words.next() {
                names.push(name.to_string());
            }
            if names.is_empty() {
                bail!("missing ref name");
            }
            Step::Delete { names }
        }
        "rename" | "copy" => {
            let old = words.required("source ref")?.to_string();
            let new = words.required("destination ref")?.to_string();
            let message = words.message();
            return Ok(if command == "rename" {
                Step::Rename { old, new, message }
            } else {
                Step::Copy { old, new, message }
            });
        }
        "pseudo-write" => {
            let name = words.required("pseudoref name")?.to_string();
            let new = parse_oid(words.required("new value")?)?;
            let old = match words.next() {
                Some(token) => parse_expected(token)?,
                None => None,
            };
            Step::PseudoWrite { name, new, old }
        }
        "pseudo-delete" => {
            let name = words.required("pseudoref name")?.to_string();
            let old = match words.next() {
                Some(token) => parse_expected(token)?,
                None => None,
            };
            Step::PseudoDelete { name, old }
        }
        "resolve" => Step::Resolve {
            name: words.required("ref name")?.to_string(),
        },
        "list" => {
            let include_broken = words.flag("--broken");
            let prefix = words.next().unwrap_or("").to_string();
            Step::List {
                prefix,
                include_broken,
            }
        }
        "reflog" => {
            let name = words.required("ref name")?.to_string();
            let mut reverse = false;
            let mut max = None;
            while let Some(word) = words.next() {
                match word {
                    "--reverse" => reverse = true,
                    "--max" => {
                        let n = words.required("count")?;
                        let count: usize =
                            n.parse().with_context(|| format!("bad count {n:?}"))?;
                        if count == 0 {
                            bail!("--max must be at least 1");
                        }
                        max = Some(count);
                    }
                    other => bail!("unexpected argument {other:?}"),
                }
            }
            Step::Reflog { name, reverse, max }
        }
        "reflog-exists" => Step::ReflogExists {
            name: words.required("ref name")?.to_string(),
        },
        "reflog-create" => {
            let force = words.flag("--force");
            Step::ReflogCreate {
                name: words.required("ref name")?.to_string(),
                force,
            }
        }
        "reflog-delete" => Step::ReflogDelete {
            name: words.required("ref name")?.to_string(),
        },
        "expire" => {
            let name = words.required("ref name")?.to_string();
            let before = words.required("timestamp")?;
            let before = before
                .parse()
                .with_context(|| format!("bad timestamp {before:?}"))?;
            let mut flags = ExpireFlags::empty();
            while let Some(word) = words.next() {
                flags |= match word {
                    "--dry-run" => ExpireFlags::DRY_RUN,
                    "--rewrite" => ExpireFlags::REWRITE,
                    "--update-ref" => ExpireFlags::UPDATE_REF,
                    "--verbose" => ExpireFlags::VERBOSE,
                    other => bail!("unexpected argument {other:?}"),
                };
            }
            Step::Expire {
                name,
                before,
                flags,
            }
        }
        "pack" => {
            let mut flags = PackFlags::empty();
            while let Some(word) = words.next() {
                flags |= match word {
                    "--all" => PackFlags::ALL,
                    "--prune" => PackFlags::PRUNE,
                    other => bail!("unexpected argument {other:?}"),
                };
            }
            Step::Pack { flags }
        }
        other => bail!("unknown command {other:?}"),
    };
    words.finish()?;
    Ok(step)
}
