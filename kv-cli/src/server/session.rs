use std::collections::HashMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Local};
use kv::btree::ops::{BTree, BTreeOptions};
use kv::coid::Coid;
use kv::config::Config;
use kv::error::{CResult, Error};
use kv::server::channel::{LocalChannel, ServerChannel};
use kv::server::commit::{KvTransaction, ServerState};
use kv::value::IntervalKind;
use rustyline::config::Builder;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{CompletionType, Editor};
use tokio::time::Instant;

use crate::rusty::CliHelper;
use crate::server::config::{ConfigLoad, DEFAULT_PROMPT};
use crate::show::Show;

/// The admin REPL of §6: a thin front-end over one in-process
/// [`ServerState`], driven entirely through the [`ServerChannel`]
/// abstraction so a networked deployment would only need to swap the
/// channel this session holds.
pub struct Session {
    is_repl: bool,
    running: Arc<AtomicBool>,

    state: Arc<ServerState>,
    channel: LocalChannel,
    btrees: HashMap<u64, BTree>,
    open_tx: HashMap<u64, KvTransaction>,

    settings: ConfigLoad,
}

impl Session {
    pub async fn try_new(settings: ConfigLoad, is_repl: bool, running: Arc<AtomicBool>) -> anyhow::Result<Self> {
        if is_repl {
            println!("Welcome to {}.", DEFAULT_PROMPT);
            println!("Connecting to local server state.");
            println!();
        }

        let config = Config::load().unwrap_or_default();
        let state = Arc::new(ServerState::new(config));
        let channel = LocalChannel::new(state.clone());

        Ok(Self { is_repl, running, state, channel, btrees: HashMap::new(), open_tx: HashMap::new(), settings })
    }

    fn prompt(&self) -> String {
        match self.settings.prompt.as_ref() {
            Some(prompt) => format!("{} > ", prompt.trim_end()),
            None => format!("{} > ", DEFAULT_PROMPT),
        }
    }

    pub async fn handle_repl(&mut self) {
        let config = Builder::new()
            .completion_prompt_limit(5)
            .completion_type(CompletionType::Circular)
            .build();
        let mut rl = Editor::<CliHelper, DefaultHistory>::with_config(config).unwrap();
        rl.set_helper(Some(CliHelper::with_keywords(Arc::new(keyword_list()))));
        rl.load_history(&get_history_path()).ok();

        'repl: loop {
            if !self.running.load(Ordering::SeqCst) {
                break 'repl;
            }

            match rl.readline(&self.prompt()) {
                Ok(line) => {
                    let _ = rl.add_history_entry(&line);
                    if !self.handle_line_lenient(&line) {
                        break 'repl;
                    }
                }
                Err(ReadlineError::Io(err)) => eprintln!("io err: {err}"),
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                    self.running.store(false, Ordering::SeqCst);
                }
                Err(ReadlineError::Eof) => break 'repl,
                Err(_) => {}
            }
        }

        println!("Bye~");
        let _ = rl.save_history(&get_history_path());
    }

    pub async fn handle_reader<R: BufRead>(&mut self, r: R) -> anyhow::Result<()> {
        let start = Instant::now();
        for line in r.lines() {
            let line = line.map_err(|e| anyhow!("read lines err: {}", e))?;
            if !self.handle_line_lenient(&line) {
                break;
            }
        }
        println!("{:.3}", start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Runs exactly one command for the non-interactive `--query` path,
    /// propagating its error (not swallowing it) so `main` can map it to
    /// §6's exit-code table.
    pub fn run_one(&mut self, line: &str) -> CResult<()> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        for row in self.dispatch(line)? {
            println!("{}", row);
        }
        Ok(())
    }

    /// REPL/batch line handling: prints the command's output or its error,
    /// never stops the session over a bad command. Returns `false` only on
    /// `exit`/`quit`.
    fn handle_line_lenient(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return true;
        }
        if line == "exit" || line == "quit" {
            return false;
        }

        let show = Show::new(self.settings.is_show_affected(), self.is_repl);
        match self.dispatch(line) {
            Ok(rows) => {
                for row in rows {
                    println!("{}", row);
                }
                show.output(1);
            }
            Err(err) => {
                eprintln!("{}", err);
                show.output(0);
            }
        }
        true
    }

    fn btree(&mut self, cid: u64) -> CResult<&BTree> {
        if !self.btrees.contains_key(&cid) {
            let tree = BTree::new(cid, self.state.config.clone(), BTreeOptions::default());
            tree.create(&self.channel)?;
            self.btrees.insert(cid, tree);
        }
        Ok(self.btrees.get(&cid).expect("just inserted"))
    }

    fn take_tx(&mut self, id: u64) -> CResult<KvTransaction> {
        self.open_tx.remove(&id).ok_or_else(|| Error::Internal(format!("no open transaction {id}")))
    }

    fn parse_tx_coid(&self, args: &[&str]) -> CResult<(u64, Coid)> {
        if args.len() < 2 {
            return Err(Error::Value("usage: <cmd> <tx> <cid>:<oid>".into()));
        }
        let id = parse_u64("tx id", Some(&args[0]))?;
        let coid = parse_coid(args[1])?;
        Ok((id, coid))
    }

    fn btree_splitter_drain(&mut self, cid: u64) -> CResult<()> {
        if self.state.config.split_location == kv::config::SplitLocation::Server {
            let tree = self.btrees.get(&cid).expect("btree just touched");
            tree.splitter.drive_pending(&self.channel)?;
        }
        Ok(())
    }

    fn cmd_status(&self) -> Vec<String> {
        vec![
            format!("coids cached: {}", self.state.cache.len()),
            format!("open transactions: {}", self.open_tx.len()),
            format!("b-trees loaded: {}", self.btrees.len()),
            format!("split-location: {}", self.state.config.split_location),
        ]
    }

    /// Dispatches one admin command, returning the lines it printed.
    fn dispatch(&mut self, line: &str) -> CResult<Vec<String>> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let cmd = parts[0].to_ascii_uppercase();
        let args = &parts[1..];

        let out = match cmd.as_str() {
            "STATUS" => self.cmd_status(),
            "TIME" => {
                let now: DateTime<Local> = Local::now();
                vec![now.format("%Y-%m-%d %H:%M:%S%.3f").to_string()]
            }
            "BEGIN" => {
                let read_only = args.first().map(|s| s.eq_ignore_ascii_case("ro")).unwrap_or(false);
                let tx = self.channel.begin_transaction(read_only);
                let id = tx.id;
                self.open_tx.insert(id, tx);
                vec![format!("tx {id} started")]
            }
            "COMMIT" => {
                let id = parse_u64("tx id", args.first())?;
                let tx = self.take_tx(id)?;
                let outcome = self.channel.commit(tx)?;
                vec![format!("committed at ts {}", outcome.commit_ts)]
            }
            "ABORT" => {
                let id = parse_u64("tx id", args.first())?;
                let tx = self.take_tx(id)?;
                self.channel.abort(tx);
                vec!["aborted".to_string()]
            }
            "GET" => {
                let (id, coid) = self.parse_tx_coid(args)?;
                let channel = &self.channel;
                let tx = self.open_tx.get_mut(&id).ok_or_else(|| Error::Internal(format!("no open transaction {id}")))?;
                match channel.get(tx, coid)? {
                    Some(value) => vec![format_value(&value)],
                    None => vec!["N/A".to_string()],
                }
            }
            "PUT" => {
                if args.len() < 3 {
                    return Err(Error::Value("usage: PUT <tx> <cid>:<oid> <bytes>".into()));
                }
                let id = parse_u64("tx id", Some(&args[0]))?;
                let coid = parse_coid(args[1])?;
                let data = args[2].as_bytes().to_vec();
                let channel = &self.channel;
                let tx = self.open_tx.get_mut(&id).ok_or_else(|| Error::Internal(format!("no open transaction {id}")))?;
                channel.put(tx, coid, data)?;
                vec!["OK".to_string()]
            }
            "DEL" => {
                let (id, coid) = self.parse_tx_coid(args)?;
                let channel = &self.channel;
                let tx = self.open_tx.get_mut(&id).ok_or_else(|| Error::Internal(format!("no open transaction {id}")))?;
                channel.delete(tx, coid)?;
                vec!["OK".to_string()]
            }
            "BTREE.PUT" => {
                if args.len() < 3 {
                    return Err(Error::Value("usage: BTREE.PUT <cid> <key> <bytes>".into()));
                }
                let cid = parse_u64("cid", Some(&args[0]))?;
                let key = parse_i64("key", &args[1])?;
                let payload = args[2].as_bytes().to_vec();
                self.btree(cid)?;
                let tree = self.btrees.get(&cid).expect("just ensured");
                tree.insert(&self.channel, key, payload)?;
                self.btree_splitter_drain(cid)?;
                vec!["OK".to_string()]
            }
            "BTREE.GET" => {
                if args.len() < 2 {
                    return Err(Error::Value("usage: BTREE.GET <cid> <key>".into()));
                }
                let cid = parse_u64("cid", Some(&args[0]))?;
                let key = parse_i64("key", &args[1])?;
                self.btree(cid)?;
                let tree = self.btrees.get(&cid).expect("just ensured");
                match tree.lookup(&self.channel, key)? {
                    Some(payload) => vec![String::from_utf8_lossy(&payload).into_owned()],
                    None => vec!["N/A".to_string()],
                }
            }
            "BTREE.SCAN" => {
                if args.len() < 3 {
                    return Err(Error::Value("usage: BTREE.SCAN <cid> <start-key> <count>".into()));
                }
                let cid = parse_u64("cid", Some(&args[0]))?;
                let start = parse_i64("start-key", &args[1])?;
                let count: usize =
                    args[2].parse().map_err(|_| Error::Value(format!("bad count {:?}", args[2])))?;
                self.btree(cid)?;
                let tree = self.btrees.get(&cid).expect("just ensured");
                tree.scan(&self.channel, start, count)?
                    .into_iter()
                    .map(|(k, v)| format!("{} = {}", k, String::from_utf8_lossy(&v)))
                    .collect()
            }
            "BTREE.DELRANGE" => {
                if args.len() < 3 {
                    return Err(Error::Value("usage: BTREE.DELRANGE <cid> <lo> <hi>".into()));
                }
                let cid = parse_u64("cid", Some(&args[0]))?;
                let lo = parse_i64("lo", &args[1])?;
                let hi = parse_i64("hi", &args[2])?;
                self.btree(cid)?;
                let tree = self.btrees.get(&cid).expect("just ensured");
                tree.delete_range(&self.channel, lo, hi, IntervalKind::ClosedOpen)?;
                vec!["OK".to_string()]
            }
            "SPLIT" => {
                let cid = parse_u64("cid", args.first())?;
                self.btree(cid)?;
                self.btree_splitter_drain(cid)?;
                vec!["OK".to_string()]
            }
            "CONFIG" => {
                let mut lines: Vec<String> =
                    self.state.config.to_map().into_iter().map(|(k, v)| format!("{} = {}", k, v)).collect();
                lines.sort();
                lines
            }
            "SET" => {
                if args.len() != 2 {
                    return Err(Error::Value("usage: SET <option> <value>".into()));
                }
                self.settings
                    .inject_cmd(args[0], args[1])
                    .map_err(|e| Error::Value(e.to_string()))?;
                vec!["OK".to_string()]
            }
            "HELP" => help_lines(),
            other => return Err(Error::Value(format!("unrecognized command {:?}, try HELP", other))),
        };
        Ok(out)
    }
}

fn help_lines() -> Vec<String> {
    vec![
        "STATUS".into(),
        "BEGIN [ro]".into(),
        "COMMIT <tx>".into(),
        "ABORT <tx>".into(),
        "GET <tx> <cid>:<oid>".into(),
        "PUT <tx> <cid>:<oid> <bytes>".into(),
        "DEL <tx> <cid>:<oid>".into(),
        "BTREE.PUT <cid> <key> <bytes>".into(),
        "BTREE.GET <cid> <key>".into(),
        "BTREE.SCAN <cid> <start-key> <count>".into(),
        "BTREE.DELRANGE <cid> <lo> <hi>".into(),
        "SPLIT <cid>".into(),
        "CONFIG".into(),
        "SET <option> <value>".into(),
        "TIME".into(),
        "exit | quit".into(),
    ]
}

fn format_value(value: &kv::value::Value) -> String {
    match value.as_blob() {
        Ok(blob) => String::from_utf8_lossy(blob.as_slice()).into_owned(),
        Err(_) => "<super-value>".to_string(),
    }
}

fn parse_coid(s: &str) -> CResult<Coid> {
    let (cid, oid) = s.split_once(':').ok_or_else(|| Error::Value(format!("expected <cid>:<oid>, got {:?}", s)))?;
    let cid: u64 = cid.parse().map_err(|_| Error::Value(format!("bad cid {:?}", cid)))?;
    let oid: u64 = oid.parse().map_err(|_| Error::Value(format!("bad oid {:?}", oid)))?;
    Ok(Coid::new(cid, oid))
}

fn parse_u64(name: &str, s: Option<&&str>) -> CResult<u64> {
    s.ok_or_else(|| Error::Value(format!("missing {name}")))?
        .parse()
        .map_err(|_| Error::Value(format!("bad {name}")))
}

fn parse_i64(name: &str, s: &str) -> CResult<i64> {
    s.parse().map_err(|_| Error::Value(format!("bad {name} {:?}", s)))
}

fn keyword_list() -> Vec<String> {
    [
        "STATUS", "BEGIN", "COMMIT", "ABORT", "GET", "PUT", "DEL", "BTREE.PUT", "BTREE.GET", "BTREE.SCAN",
        "BTREE.DELRANGE", "SPLIT", "CONFIG", "SET", "TIME", "HELP",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn get_history_path() -> String {
    format!("{}/.kvcli_history", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}
