/// SMTP Response Codes, Command Parsing and Dispatch
use std::fmt;

/// SMTP response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub u16);

impl ResponseCode {
    pub const READY: Self = Self(220);
    pub const OK: Self = Self(250);
    pub const START_INPUT: Self = Self(354);
    pub const COMMAND_NOT_IMPLEMENTED: Self = Self(502);
    pub const BAD_SEQUENCE: Self = Self(503);
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hostname used in the HELO/EHLO greeting unless configured otherwise
pub const DEFAULT_HOSTNAME: &str = "dummy-smtp-localhost";

/// SMTP commands the dispatcher knows about. Verbs are case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    StartTls,
    Unknown,
}

impl Command {
    /// Split a line into its verb and the remaining arguments
    pub fn parse(line: &str) -> (Self, Vec<&str>) {
        let mut tokens = line.split_whitespace();
        let command = match tokens.next().unwrap_or("") {
            "HELO" => Self::Helo,
            "EHLO" => Self::Ehlo,
            "MAIL" => Self::Mail,
            "RCPT" => Self::Rcpt,
            "DATA" => Self::Data,
            "STARTTLS" => Self::StartTls,
            _ => Self::Unknown,
        };

        (command, tokens.collect())
    }
}

/// Line that ends a session, compared against the whole line
pub const QUIT: &str = "QUIT";

/// Line that terminates DATA input
pub const END_OF_DATA: &str = ".";

/// What the dispatcher knows about the session
#[derive(Debug, Clone)]
pub struct Context<'a> {
    pub hostname: &'a str,
    /// A certificate identifier was configured
    pub tls_offered: bool,
    /// The connection has already been upgraded
    pub tls_active: bool,
}

impl Context<'_> {
    fn can_start_tls(&self) -> bool {
        self.tls_offered && !self.tls_active
    }
}

/// Session transition requested by a dispatched command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Switch to capturing message content
    EnterData,
    /// Begin the TLS handshake once the reply is flushed
    StartTls,
}

/// Lines to send for one command, in order, plus the follow-up action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub action: Action,
}

impl Reply {
    fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            action: Action::None,
        }
    }

    fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }
}

/// SMTP response builder
pub struct Response;

impl Response {
    /// Create a simple response
    pub fn new(code: ResponseCode, message: &str) -> String {
        format!("{} {}", code, message)
    }

    /// Create a multi-line response (last line has space after code)
    pub fn multi_line(code: ResponseCode, lines: &[&str]) -> Vec<String> {
        if lines.is_empty() {
            return vec![Self::new(code, "")];
        }

        let last = lines.len() - 1;
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                if i < last {
                    format!("{code}-{line}")
                } else {
                    format!("{code} {line}")
                }
            })
            .collect()
    }

    /// Greeting sent on connect
    pub fn greeting() -> String {
        Self::new(ResponseCode::READY, "Ready")
    }

    /// HELO/EHLO response
    pub fn hello(hostname: &str, client: &str, starttls: bool) -> Vec<String> {
        let greeting = format!("{hostname} Hello {client}");
        let mut lines = vec![greeting.trim_end()];
        if starttls {
            lines.push("STARTTLS");
        }
        lines.push("OK");
        Self::multi_line(ResponseCode::OK, &lines)
    }

    pub fn ok() -> String {
        Self::new(ResponseCode::OK, "OK")
    }

    pub fn accepted() -> String {
        Self::new(ResponseCode::OK, "Accepted")
    }

    /// DATA prompt
    pub fn start_input() -> String {
        Self::new(
            ResponseCode::START_INPUT,
            "Start mail input; end with <CR><LF>.<CR><LF>",
        )
    }

    /// STARTTLS acknowledgment
    pub fn starttls() -> String {
        Self::new(ResponseCode::READY, "2.0.0 SMTP server ready")
    }

    /// STARTTLS without a configured certificate
    pub fn starttls_unavailable() -> String {
        Self::new(
            ResponseCode::COMMAND_NOT_IMPLEMENTED,
            "5.5.1 STARTTLS not supported",
        )
    }

    /// STARTTLS over an already secure channel
    pub fn tls_already_active() -> String {
        Self::new(ResponseCode::BAD_SEQUENCE, "5.5.1 TLS already active")
    }
}

/// Map one command line to the reply the session must send.
///
/// Never rejects envelope input: unknown verbs and malformed arguments are
/// acknowledged with `250 OK`.
pub fn dispatch(line: &str, ctx: &Context<'_>) -> Reply {
    let (command, args) = Command::parse(line);

    match command {
        Command::Helo | Command::Ehlo => {
            let client = args.first().copied().unwrap_or("");
            Reply::new(Response::hello(ctx.hostname, client, ctx.can_start_tls()))
        }
        Command::Mail => Reply::new(vec![Response::ok()]),
        Command::Rcpt => Reply::new(vec![Response::accepted()]),
        Command::Data => Reply::new(vec![Response::start_input()]).with_action(Action::EnterData),
        Command::StartTls if ctx.can_start_tls() => {
            Reply::new(vec![Response::starttls()]).with_action(Action::StartTls)
        }
        Command::StartTls if ctx.tls_active => Reply::new(vec![Response::tls_already_active()]),
        Command::StartTls => Reply::new(vec![Response::starttls_unavailable()]),
        Command::Unknown => Reply::new(vec![Response::ok()]),
    }
}
