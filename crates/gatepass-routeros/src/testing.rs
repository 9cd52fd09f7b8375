//! In-process mock appliance for integration tests.
//!
//! Listens on a real TCP port and speaks the actual wire protocol, so
//! channel, user-manager, and binder tests exercise true framing and
//! login handshakes. State is a handful of in-memory tables plus a
//! command log for asserting what was (or was not) sent.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use secrecy::SecretString;
use tokio::net::{TcpListener, TcpStream};

use crate::channel::DeviceEndpoint;
use crate::error::Error;
use crate::proto;

/// One table row: attribute name to value, in insertion order.
pub type TableRow = IndexMap<String, String>;

/// Build a [`TableRow`] from string pairs.
pub fn table_row(pairs: &[(&str, &str)]) -> TableRow {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

/// Fixed challenge handed out when `challenge_login` is on.
const CHALLENGE_HEX: &str = "aabbccddeeff00112233445566778899";

/// How `/ip/hotspot/active/login` behaves.
#[derive(Debug, Clone)]
pub enum LoginBehavior {
    /// Accept, and materialize an active row when `login_creates_active`.
    Accept,
    /// Trap with an "already logged in" message.
    TrapAlreadyLoggedIn,
    /// Trap with the given message.
    Reject(String),
}

/// Mutable mock state. Tests reach it through [`MockDevice::lock`] or
/// the seeding helpers.
#[derive(Debug)]
pub struct DeviceState {
    pub api_username: String,
    pub api_password: String,
    /// Answer the first `/login` with a pre-6.43 md5 challenge.
    pub challenge_login: bool,
    pub version: String,
    pub users: Vec<TableRow>,
    pub profiles: Vec<TableRow>,
    pub hosts: Vec<TableRow>,
    pub actives: Vec<TableRow>,
    pub cookies: Vec<TableRow>,
    pub scripts: Vec<TableRow>,
    pub login_behavior: LoginBehavior,
    /// Insert an active row when a hotspot login is accepted.
    pub login_creates_active: bool,
    /// Active row inserted when `/system/script/run` executes.
    pub script_run_creates_active: Option<TableRow>,
    /// Accept `/ip/hotspot/user/add` without persisting the row, like
    /// a device whose user table lags its command acks.
    pub user_add_is_silent: bool,
    /// Reply `!fatal` and drop the connection for this many commands.
    pub fail_next_commands: u32,
    /// Every dispatched command, words joined with spaces.
    pub command_log: Vec<String>,
    next_id: u64,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            api_username: "api".into(),
            api_password: "letmein".into(),
            challenge_login: false,
            version: "6.48.6 (long-term)".into(),
            users: Vec::new(),
            profiles: Vec::new(),
            hosts: Vec::new(),
            actives: Vec::new(),
            cookies: Vec::new(),
            scripts: Vec::new(),
            login_behavior: LoginBehavior::Accept,
            login_creates_active: true,
            script_run_creates_active: None,
            user_add_is_silent: false,
            fail_next_commands: 0,
            command_log: Vec::new(),
            next_id: 1,
        }
    }
}

impl DeviceState {
    fn next_record_id(&mut self) -> String {
        let id = format!("*{:X}", self.next_id);
        self.next_id += 1;
        id
    }
}

// ── Mock device ──────────────────────────────────────────────────────

/// A mock appliance bound to a loopback port.
pub struct MockDevice {
    addr: SocketAddr,
    state: Arc<Mutex<DeviceState>>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MockDevice {
    pub async fn start() -> Self {
        Self::start_with(DeviceState::default()).await
    }

    pub async fn start_with(state: DeviceState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock device");
        let addr = listener.local_addr().expect("mock device addr");
        let state = Arc::new(Mutex::new(state));
        let loop_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&loop_state);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, state).await;
                });
            }
        });
        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint pointing at this mock with its accepted credentials.
    pub fn endpoint(&self) -> DeviceEndpoint {
        let state = self.lock();
        DeviceEndpoint::new(
            self.addr.ip().to_string(),
            self.addr.port(),
            state.api_username.clone(),
            SecretString::from(state.api_password.clone()),
        )
    }

    /// Lock the state for inspection or seeding.
    pub fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().expect("mock device state poisoned")
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().command_log.clone()
    }

    /// Dispatched commands whose path matches exactly.
    pub fn commands_for(&self, path: &str) -> Vec<String> {
        self.lock()
            .command_log
            .iter()
            .filter(|c| c.split(' ').next() == Some(path))
            .cloned()
            .collect()
    }

    // ── Seeding helpers ──────────────────────────────────────────────

    pub fn add_profile(&self, name: &str) {
        let mut state = self.lock();
        let id = state.next_record_id();
        state.profiles.push(table_row(&[
            (".id", &id),
            ("name", name),
            ("session-timeout", "1d"),
            ("shared-users", "1"),
        ]));
    }

    pub fn add_user(&self, name: &str, password: &str, profile: &str) {
        let mut state = self.lock();
        let id = state.next_record_id();
        state.users.push(table_row(&[
            (".id", &id),
            ("name", name),
            ("password", password),
            ("profile", profile),
            ("disabled", "no"),
        ]));
    }

    pub fn add_host(&self, mac: &str, address: &str, server: &str) {
        let mut state = self.lock();
        let id = state.next_record_id();
        state.hosts.push(table_row(&[
            (".id", &id),
            ("mac-address", mac),
            ("address", address),
            ("to-address", address),
            ("server", server),
        ]));
    }

    pub fn add_active(&self, user: &str, address: &str, mac: &str) {
        let mut state = self.lock();
        let id = state.next_record_id();
        state.actives.push(table_row(&[
            (".id", &id),
            ("user", user),
            ("address", address),
            ("mac-address", mac),
            ("uptime", "5m"),
        ]));
    }

    pub fn user_names(&self) -> Vec<String> {
        self.lock()
            .users
            .iter()
            .filter_map(|r| r.get("name").cloned())
            .collect()
    }

    pub fn active_users(&self) -> Vec<String> {
        self.lock()
            .actives
            .iter()
            .filter_map(|r| r.get("user").cloned())
            .collect()
    }

    pub fn script_names(&self) -> Vec<String> {
        self.lock()
            .scripts
            .iter()
            .filter_map(|r| r.get("name").cloned())
            .collect()
    }

    pub fn cookie_count(&self) -> usize {
        self.lock().cookies.len()
    }

    pub fn set_login_behavior(&self, behavior: LoginBehavior) {
        self.lock().login_behavior = behavior;
    }

    pub fn set_version(&self, version: &str) {
        self.lock().version = version.into();
    }

    pub fn fail_next_commands(&self, n: u32) {
        self.lock().fail_next_commands = n;
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ── Connection handling ──────────────────────────────────────────────

async fn serve_connection(
    mut stream: TcpStream,
    state: Arc<Mutex<DeviceState>>,
) -> Result<(), Error> {
    if !handle_login(&mut stream, &state).await? {
        return Ok(());
    }
    loop {
        let words = proto::read_sentence(&mut stream).await?;
        if words.is_empty() {
            continue;
        }
        let (replies, disconnect) = dispatch(&state, &words);
        for sentence in &replies {
            proto::write_sentence(&mut stream, sentence).await?;
        }
        if disconnect {
            return Ok(());
        }
    }
}

async fn handle_login(
    stream: &mut TcpStream,
    state: &Arc<Mutex<DeviceState>>,
) -> Result<bool, Error> {
    let words = proto::read_sentence(stream).await?;
    let (path, attrs) = split_request(&words);
    if path != "/login" {
        proto::write_sentence(stream, &trap_sentence("not logged in")).await?;
        return Ok(false);
    }

    let (expected_user, expected_pass, challenge_mode) = {
        let s = state.lock().expect("mock device state poisoned");
        (
            s.api_username.clone(),
            s.api_password.clone(),
            s.challenge_login,
        )
    };

    if challenge_mode && !attrs.contains_key("response") {
        let ret = vec!["!done".to_owned(), format!("=ret={CHALLENGE_HEX}")];
        proto::write_sentence(stream, &ret).await?;

        let words = proto::read_sentence(stream).await?;
        let (path, attrs) = split_request(&words);
        let expected = challenge_response(&expected_pass);
        if path == "/login"
            && attrs.get("name") == Some(&expected_user)
            && attrs.get("response") == Some(&expected)
        {
            proto::write_sentence(stream, &done_sentence()).await?;
            return Ok(true);
        }
        proto::write_sentence(stream, &trap_sentence("invalid user name or password (6)")).await?;
        return Ok(false);
    }

    if attrs.get("name") == Some(&expected_user) && attrs.get("password") == Some(&expected_pass) {
        proto::write_sentence(stream, &done_sentence()).await?;
        Ok(true)
    } else {
        proto::write_sentence(stream, &trap_sentence("invalid user name or password (6)")).await?;
        Ok(false)
    }
}

/// Mirror of the client's challenge computation.
fn challenge_response(password: &str) -> String {
    let challenge = hex::decode(CHALLENGE_HEX).expect("static challenge decodes");
    let mut seed = vec![0u8];
    seed.extend_from_slice(password.as_bytes());
    seed.extend_from_slice(&challenge);
    format!("00{:x}", md5::compute(&seed))
}

// ── Dispatch ─────────────────────────────────────────────────────────

fn dispatch(state: &Arc<Mutex<DeviceState>>, words: &[String]) -> (Vec<Vec<String>>, bool) {
    let (path, attrs) = split_request(words);
    let mut s = state.lock().expect("mock device state poisoned");
    s.command_log.push(words.join(" "));

    if s.fail_next_commands > 0 {
        s.fail_next_commands -= 1;
        return (
            vec![vec!["!fatal".to_owned(), "session terminated".to_owned()]],
            true,
        );
    }

    let replies = match path.as_str() {
        "/system/identity/print" => rows_reply(&[table_row(&[("name", "MockTik")])]),
        "/system/resource/print" => {
            let version = s.version.clone();
            rows_reply(&[table_row(&[("version", &version), ("board-name", "x86")])])
        }
        "/ip/hotspot/user/profile/print" => rows_reply(&s.profiles),
        "/ip/hotspot/user/print" => rows_reply(&s.users),
        "/ip/hotspot/user/add" => user_add(&mut s, &attrs),
        "/ip/hotspot/user/set" => table_set(&mut s.users, &attrs),
        "/ip/hotspot/user/remove" => table_remove(&mut s.users, &attrs),
        "/ip/hotspot/host/print" => rows_reply(&s.hosts),
        "/ip/hotspot/cookie/print" => rows_reply(&s.cookies),
        "/ip/hotspot/cookie/add" => row_add(&mut s, Table::Cookies, &attrs),
        "/ip/hotspot/cookie/remove" => table_remove(&mut s.cookies, &attrs),
        "/ip/hotspot/active/print" => rows_reply(&s.actives),
        "/ip/hotspot/active/login" => hotspot_login(&mut s, &attrs),
        "/ip/hotspot/active/remove" => table_remove(&mut s.actives, &attrs),
        "/system/script/print" => rows_reply(&s.scripts),
        "/system/script/add" => row_add(&mut s, Table::Scripts, &attrs),
        "/system/script/remove" => table_remove(&mut s.scripts, &attrs),
        "/system/script/run" => script_run(&mut s),
        _ => trap_reply("no such command"),
    };
    (replies, false)
}

enum Table {
    Cookies,
    Scripts,
}

fn split_request(words: &[String]) -> (String, TableRow) {
    let path = words.first().cloned().unwrap_or_default();
    let mut attrs = TableRow::new();
    for word in words.iter().skip(1) {
        let body = word
            .strip_prefix('=')
            .or_else(|| word.strip_prefix('?'))
            .unwrap_or(word);
        match body.split_once('=') {
            Some((k, v)) => {
                attrs.insert(k.to_owned(), v.to_owned());
            }
            None => {
                attrs.insert(body.to_owned(), String::new());
            }
        }
    }
    (path, attrs)
}

fn done_sentence() -> Vec<String> {
    vec!["!done".to_owned()]
}

fn trap_sentence(message: &str) -> Vec<String> {
    vec!["!trap".to_owned(), format!("=message={message}")]
}

fn trap_reply(message: &str) -> Vec<Vec<String>> {
    vec![trap_sentence(message), done_sentence()]
}

fn rows_reply(rows: &[TableRow]) -> Vec<Vec<String>> {
    let mut sentences: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            let mut words = vec!["!re".to_owned()];
            words.extend(row.iter().map(|(k, v)| format!("={k}={v}")));
            words
        })
        .collect();
    sentences.push(done_sentence());
    sentences
}

fn user_add(state: &mut DeviceState, attrs: &TableRow) -> Vec<Vec<String>> {
    let name = attrs.get("name").cloned().unwrap_or_default();
    if state.users.iter().any(|u| u.get("name") == Some(&name)) {
        return trap_reply("failure: already have user with this name for this server");
    }
    if state.user_add_is_silent {
        return vec![done_sentence()];
    }
    let id = state.next_record_id();
    let mut row = table_row(&[(".id", &id)]);
    for (k, v) in attrs {
        row.insert(k.clone(), v.clone());
    }
    state.users.push(row);
    vec![done_sentence()]
}

fn row_add(state: &mut DeviceState, table: Table, attrs: &TableRow) -> Vec<Vec<String>> {
    let id = state.next_record_id();
    let mut row = table_row(&[(".id", &id)]);
    for (k, v) in attrs {
        row.insert(k.clone(), v.clone());
    }
    match table {
        Table::Cookies => state.cookies.push(row),
        Table::Scripts => state.scripts.push(row),
    }
    vec![done_sentence()]
}

fn table_set(rows: &mut [TableRow], attrs: &TableRow) -> Vec<Vec<String>> {
    let Some(target) = attrs.get(".id").or_else(|| attrs.get("numbers")) else {
        return trap_reply("no such item");
    };
    let Some(row) = rows.iter_mut().find(|r| r.get(".id") == Some(target)) else {
        return trap_reply("no such item");
    };
    for (k, v) in attrs {
        if k != ".id" && k != "numbers" {
            row.insert(k.clone(), v.clone());
        }
    }
    vec![done_sentence()]
}

fn table_remove(rows: &mut Vec<TableRow>, attrs: &TableRow) -> Vec<Vec<String>> {
    let Some(target) = attrs.get(".id").or_else(|| attrs.get("numbers")) else {
        return trap_reply("no such item");
    };
    let before = rows.len();
    rows.retain(|r| r.get(".id") != Some(target));
    if rows.len() == before {
        return trap_reply("no such item");
    }
    vec![done_sentence()]
}

fn hotspot_login(state: &mut DeviceState, attrs: &TableRow) -> Vec<Vec<String>> {
    match state.login_behavior.clone() {
        LoginBehavior::Accept => {
            if state.login_creates_active {
                let id = state.next_record_id();
                let user = attrs.get("user").cloned().unwrap_or_default();
                let mut row = table_row(&[(".id", &id), ("user", &user), ("uptime", "1s")]);
                if let Some(ip) = attrs.get("ip") {
                    row.insert("address".to_owned(), ip.clone());
                }
                if let Some(mac) = attrs.get("mac-address") {
                    row.insert("mac-address".to_owned(), mac.clone());
                }
                state.actives.push(row);
            }
            vec![done_sentence()]
        }
        LoginBehavior::TrapAlreadyLoggedIn => {
            let user = attrs.get("user").cloned().unwrap_or_default();
            trap_reply(&format!("web browser: user {user} already logged in"))
        }
        LoginBehavior::Reject(message) => trap_reply(&message),
    }
}

fn script_run(state: &mut DeviceState) -> Vec<Vec<String>> {
    if let Some(mut row) = state.script_run_creates_active.clone() {
        if row.get(".id").is_none() {
            let id = state.next_record_id();
            row.insert(".id".to_owned(), id);
        }
        state.actives.push(row);
    }
    vec![done_sentence()]
}
