use std::io::{self, Read, Write};

use anyhow::{bail, Context};
use colored::Colorize;
use refscope_refs::{
    open_store, IterFlags, RawRef, RefBackend, RefType, ReflogEntry, ReflogExpiryPolicy,
    StoreConfig, Transaction, UpdateFlags,
};
use refscope_types::ObjectId;
use tracing::{debug, warn};

use crate::cli::*;
use crate::script::{parse_script, Line, Step};

/// Symref chains longer than this are reported as broken.
const MAX_SYMREF_DEPTH: usize = 5;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    if cli.trace {
        config.trace_refs = true;
    }
    if cli.no_trace {
        config.trace_refs = false;
    }
    match cli.command {
        Command::Run(args) => cmd_run(&config, args),
        Command::Config(args) => cmd_config(&config, args),
    }
}

fn cmd_run(config: &StoreConfig, args: RunArgs) -> anyhow::Result<()> {
    let source = if args.script == "-" {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("reading script from stdin")?;
        text
    } else {
        std::fs::read_to_string(&args.script)
            .with_context(|| format!("reading script {}", args.script))?
    };
    let lines = parse_script(&source)?;
    debug!(steps = lines.len(), script = %args.script, "replaying");

    let mut session = Session::new(open_store(config), io::stdout());
    let failures = replay(&mut session, &lines, args.keep_going)?;
    session.finish()?;
    if failures > 0 {
        bail!("{failures} step(s) failed");
    }
    Ok(())
}

/// Run every line, stopping at the first failure unless `keep_going` is set.
/// Returns the number of failed steps.
fn replay<W: Write>(
    session: &mut Session<W>,
    lines: &[Line],
    keep_going: bool,
) -> anyhow::Result<usize> {
    let mut failures = 0;
    for line in lines {
        if let Err(e) = session.step(&line.step) {
            if !keep_going {
                return Err(e.context(format!("line {}: {}", line.number, line.text)));
            }
            eprintln!(
                "{} line {}: {}: {e:#}",
                "error:".red().bold(),
                line.number,
                line.text
            );
            failures += 1;
        }
    }
    Ok(failures)
}

fn cmd_config(config: &StoreConfig, args: ConfigArgs) -> anyhow::Result<()> {
    let text = config.to_toml_string()?;
    let Some(key) = args.key else {
        print!("{text}");
        return Ok(());
    };
    let table: toml::Table = text.parse()?;
    match table.get(&key) {
        Some(toml::Value::String(s)) => println!("{s}"),
        Some(value) => println!("{value}"),
        None => bail!("unknown config key {key:?}"),
    }
    Ok(())
}

/// Removes reflog entries recorded before `cutoff`.
struct PruneOlderThan {
    cutoff: i64,
    pruned: usize,
}

impl ReflogExpiryPolicy for PruneOlderThan {
    fn should_prune(&mut self, entry: &ReflogEntry) -> bool {
        let prune = entry.timestamp < self.cutoff;
        if prune {
            self.pruned += 1;
        }
        prune
    }
}

/// A store plus the transaction opened by `begin`, if any.
pub struct Session<W> {
    store: Box<dyn RefBackend>,
    pending: Option<Transaction>,
    out: W,
}

impl<W: Write> Session<W> {
    pub fn new(store: Box<dyn RefBackend>, out: W) -> Self {
        Self {
            store,
            pending: None,
            out,
        }
    }

    /// Abort a transaction left open by the script and hand back the output.
    pub fn finish(mut self) -> anyhow::Result<W> {
        if let Some(mut tx) = self.pending.take() {
            warn!(updates = tx.len(), "script ended inside a transaction; aborting it");
            self.store.transaction_abort(&mut tx)?;
        }
        Ok(self.out)
    }

    fn take_pending(&mut self) -> anyhow::Result<Transaction> {
        self.pending.take().context("no transaction is open")
    }

    fn commit(&self, mut tx: Transaction) -> anyhow::Result<()> {
        self.store.transaction_prepare(&mut tx)?;
        self.store.transaction_finish(&mut tx)?;
        Ok(())
    }

    /// Queue into the open transaction, or commit a one-update transaction
    /// when none is open.
    fn queue(&mut self, add: impl FnOnce(&mut Transaction)) -> anyhow::Result<()> {
        match self.pending.as_mut() {
            Some(tx) => {
                add(tx);
                Ok(())
            }
            None => {
                let mut tx = Transaction::begin(self.store.as_ref());
                add(&mut tx);
                self.commit(tx)
            }
        }
    }

    /// Follow `name` through symrefs. Returns the chain of names visited and
    /// the final value.
    fn resolve(&self, name: &str) -> anyhow::Result<(Vec<String>, ObjectId)> {
        let mut chain = vec![name.to_string()];
        for _ in 0..=MAX_SYMREF_DEPTH {
            let mut raw = RawRef::default();
            let current = chain.last().map(String::as_str).unwrap_or(name);
            self.store.read_raw_ref(current, &mut raw)?;
            if !raw.kind.contains(RefType::SYMREF) {
                return Ok((chain, raw.oid));
            }
            chain.push(raw.referent);
        }
        bail!("symref chain too deep at {name}")
    }

    pub fn step(&mut self, step: &Step) -> anyhow::Result<()> {
        match step {
            Step::Init => self.store.init_db()?,
            Step::Begin => {
                if self.pending.is_some() {
                    bail!("a transaction is already open");
                }
                self.pending = Some(Transaction::begin(self.store.as_ref()));
            }
            Step::Update {
                name,
                new,
                old,
                flags,
                message,
            } => self.queue(|tx| tx.update(name.as_str(), *new, *old, *flags, message.as_str()))?,
            Step::DeleteRef {
                name,
                old,
                flags,
                message,
            } => self.queue(|tx| tx.delete(name.as_str(), *old, *flags, message.as_str()))?,
            Step::Commit => {
                let tx = self.take_pending()?;
                self.commit(tx)?;
            }
            Step::Abort => {
                let mut tx = self.take_pending()?;
                self.store.transaction_abort(&mut tx)?;
            }
            Step::InitialCommit => {
                let mut tx = self.take_pending()?;
                self.store.initial_transaction_commit(&mut tx)?;
            }
            Step::Symref {
                name,
                target,
                message,
            } => self.store.create_symref(name, target, message)?,
            Step::Delete { names } => {
                self.store.delete_refs("", names, UpdateFlags::empty())?
            }
            Step::Rename { old, new, message } => self.store.rename_ref(old, new, message)?,
            Step::Copy { old, new, message } => self.store.copy_ref(old, new, message)?,
            Step::PseudoWrite { name, new, old } => {
                self.store.write_pseudoref(name, new, old.as_ref())?
            }
            Step::PseudoDelete { name, old } => self.store.delete_pseudoref(name, old.as_ref())?,
            Step::Resolve { name } => {
                let (chain, oid) = self.resolve(name)?;
                writeln!(self.out, "{} {}", oid.to_hex().yellow(), chain.join(" -> "))?;
            }
            Step::List {
                prefix,
                include_broken,
            } => {
                let mut flags = IterFlags::empty();
                flags.set(IterFlags::INCLUDE_BROKEN, *include_broken);
                for entry in self.store.iterator_begin(prefix, flags)? {
                    let mark = if entry.kind.contains(RefType::BROKEN) {
                        " (broken)".red().to_string()
                    } else if entry.kind.contains(RefType::PACKED) {
                        " (packed)".dimmed().to_string()
                    } else {
                        String::new()
                    };
                    writeln!(self.out, "{} {}{mark}", entry.oid.to_hex().yellow(), entry.name)?;
                }
            }
            Step::Reflog { name, reverse, max } => self.show_reflog(name, *reverse, *max)?,
            Step::Reflogs => {
                for entry in self.store.reflog_iterator_begin()? {
                    writeln!(self.out, "{}", entry.name)?;
                }
            }
            Step::ReflogExists { name } => {
                let exists = self.store.reflog_exists(name);
                let word = if exists { "yes".green() } else { "no".red() };
                writeln!(self.out, "{name}: {word}")?;
            }
            Step::ReflogCreate { name, force } => self.store.create_reflog(name, *force)?,
            Step::ReflogDelete { name } => self.store.delete_reflog(name)?,
            Step::Expire {
                name,
                before,
                flags,
            } => {
                let oid = match self.resolve(name) {
                    Ok((_, oid)) => oid,
                    Err(_) => ObjectId::null(),
                };
                let mut policy = PruneOlderThan {
                    cutoff: *before,
                    pruned: 0,
                };
                self.store.reflog_expire(name, &oid, *flags, &mut policy)?;
                writeln!(
                    self.out,
                    "{name}: {} reflog entries older than {before} expired",
                    policy.pruned.to_string().bold()
                )?;
            }
            Step::Pack { flags } => self.store.pack_refs(*flags)?,
        }
        Ok(())
    }

    fn show_reflog(&mut self, name: &str, reverse: bool, max: Option<usize>) -> anyhow::Result<()> {
        if max == Some(0) {
            return Ok(());
        }
        let Self { store, out, .. } = self;
        let mut shown = 0usize;
        let mut write_err = None;
        let mut print = |entry: &ReflogEntry| {
            if let Err(e) = writeln!(
                out,
                "{} {} {} {}\t{}",
                entry.old.short_hex().dimmed(),
                entry.new.short_hex().yellow(),
                entry.committer,
                entry.timestamp,
                entry.message
            ) {
                write_err = Some(e);
                return 1;
            }
            shown += 1;
            match max {
                Some(max) if shown >= max => 1,
                _ => 0,
            }
        };
        if reverse {
            store.for_each_reflog_ent_reverse(name, &mut print)?;
        } else {
            store.for_each_reflog_ent(name, &mut print)?;
        }
        if let Some(e) = write_err {
            return Err(e.into());
        }
        Ok(())
    }
}
