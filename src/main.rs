//! Purpose: `predictcrop` CLI entry point.
//! Role: Binary crate root; parses args, runs the HTTP server or a single in-process invocation.
//! Invariants: `invoke` prints exactly one JSON reply envelope on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
use std::ffi::OsString;
use std::io::{self, IsTerminal, Read};
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};

mod serve;

use predictcrop::api::{
    DEFAULT_COMMAND, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT_MS, Error, ErrorKind, ProcessRunner,
    handle, request_payload, to_exit_code, validate_script_settings,
};

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_MAX_BODY_BYTES: u64 = 1024 * 1024;

fn main() {
    let exit_code = match run(std::env::args_os()) {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run<I>(args: I) -> Result<i32, Error>
where
    I: IntoIterator<Item = OsString>,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(exit_code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `predictcrop --help`."));
            }
        },
    };

    dispatch(cli.command).map_err(add_hint)
}

#[derive(Parser)]
#[command(
    name = "predictcrop",
    version,
    about = "Relay JSON requests to a local prediction script",
    long_about = r#"Relay JSON requests to a local prediction script.

Each request body is written as JSON to the script's stdin; the JSON the script
prints on stdout becomes the response. Anything on stderr, a non-zero exit, or a
timeout turns into a 500 reply with an {"error": ...} body."#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Serve the prediction function over HTTP",
        after_help = r#"EXAMPLES
  $ predictcrop serve
  $ predictcrop serve --bind 127.0.0.1:9000 --timeout-ms 2000
  $ predictcrop serve --command "python3 functions/backend.py"
  $ predictcrop serve check

NOTES
  - The function answers on / and /predictCrop for any HTTP method
  - GET /healthz returns {"ok":true}
  - Set RUST_LOG=debug to log every script invocation"#
    )]
    Serve {
        #[command(subcommand)]
        subcommand: Option<ServeSubcommand>,
        #[command(flatten)]
        run: ServeRunArgs,
    },
    #[command(
        about = "Run the prediction script once and print the reply",
        long_about = r#"Run the prediction script once, exactly as the HTTP function would.

The request body comes from --data-json or stdin and is decoded the same way as an
HTTP body: empty means {}, JSON is taken as-is, other text is sent as a JSON string. Prints {"status": <code>, "body": <json>}
and exits 0 for a 200 reply, 1 otherwise."#,
        after_help = r#"EXAMPLES
  $ predictcrop invoke --data-json '{"Carbon": 1.2, "Calcium": 30}'
  $ cat sample.json | predictcrop invoke --timeout-ms 10000"#
    )]
    Invoke(InvokeArgs),
}

#[derive(Subcommand)]
enum ServeSubcommand {
    #[command(about = "Validate server config and print it without binding")]
    Check {
        #[arg(long, help = "Emit the resolved config as JSON")]
        json: bool,
    },
}

#[derive(Args)]
struct ScriptArgs {
    #[arg(
        long,
        default_value = DEFAULT_COMMAND,
        help = "Shell command that runs the prediction script",
        help_heading = "Script"
    )]
    command: String,
    #[arg(
        long,
        default_value_t = DEFAULT_TIMEOUT_MS,
        help = "Kill the script after this many milliseconds",
        help_heading = "Script"
    )]
    timeout_ms: u64,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_OUTPUT_BYTES,
        help = "Max bytes captured from the script's stdout or stderr",
        help_heading = "Script"
    )]
    max_output_bytes: u64,
}

#[derive(Args)]
struct ServeRunArgs {
    #[arg(
        long,
        default_value = DEFAULT_BIND,
        help = "Bind address",
        help_heading = "Connection"
    )]
    bind: String,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_BODY_BYTES,
        help = "Max request body size in bytes",
        help_heading = "Safety"
    )]
    max_body_bytes: u64,
    #[command(flatten)]
    script: ScriptArgs,
}

#[derive(Args)]
struct InvokeArgs {
    #[arg(long, value_name = "JSON", help = "Request body (reads stdin when omitted)")]
    data_json: Option<String>,
    #[command(flatten)]
    script: ScriptArgs,
}

fn dispatch(command: Command) -> Result<i32, Error> {
    match command {
        Command::Serve { subcommand, run } => {
            let config = serve_config_from_run_args(run)?;
            match subcommand {
                Some(ServeSubcommand::Check { json }) => {
                    serve::validate_config(&config)?;
                    emit_serve_check(&config, json || !io::stdout().is_terminal());
                    Ok(0)
                }
                None => {
                    let runtime = tokio::runtime::Builder::new_multi_thread()
                        .enable_all()
                        .build()
                        .map_err(|err| {
                            Error::new(ErrorKind::Internal)
                                .with_message("failed to start runtime")
                                .with_source(err)
                        })?;
                    runtime.block_on(serve::serve(config))?;
                    Ok(0)
                }
            }
        }
        Command::Invoke(args) => invoke(args),
    }
}

fn serve_config_from_run_args(run: ServeRunArgs) -> Result<serve::ServeConfig, Error> {
    let bind: SocketAddr = run.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:8080.")
    })?;
    Ok(serve::ServeConfig {
        bind,
        command: run.script.command,
        timeout_ms: run.script.timeout_ms,
        max_body_bytes: run.max_body_bytes,
        max_output_bytes: run.script.max_output_bytes,
    })
}

fn invoke(args: InvokeArgs) -> Result<i32, Error> {
    validate_script_settings(
        &args.script.command,
        args.script.timeout_ms,
        args.script.max_output_bytes,
    )?;
    let payload = match args.data_json {
        Some(text) => request_payload(text.as_bytes()),
        None => {
            let mut body = Vec::new();
            io::stdin().read_to_end(&mut body).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read request body from stdin")
                    .with_source(err)
            })?;
            request_payload(&body)
        }
    };

    let runner = ProcessRunner::new(args.script.command)
        .with_max_output_bytes(args.script.max_output_bytes);
    let timeout = Duration::from_millis(args.script.timeout_ms);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    let reply = runtime.block_on(handle(&runner, &payload, timeout));

    let status = reply.status_code();
    emit_json(json!({ "status": status.as_u16(), "body": reply.into_body() }));
    Ok(if status.is_success() { 0 } else { 1 })
}

fn emit_serve_check(config: &serve::ServeConfig, as_json: bool) {
    if as_json {
        emit_json(json!({
            "config": config,
            "routes": ["/", serve::FUNCTION_ROUTE, "/healthz"],
        }));
        return;
    }
    println!("config ok");
    println!("  function: http://{}{}", config.bind, serve::FUNCTION_ROUTE);
    println!("  command:  {}", config.command);
    println!("  timeout:  {} ms", config.timeout_ms);
    println!(
        "  limits:   body {} bytes, script output {} bytes",
        config.max_body_bytes, config.max_output_bytes
    );
}

fn emit_json(value: Value) {
    let json = serde_json::to_string(&value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn add_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Io => err.with_hint("I/O error. Check that the bind address is free."),
        ErrorKind::Internal => err.with_hint("Internal error. Re-run with RUST_LOG=debug."),
        _ => err,
    }
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(err.describe()));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(command) = err.command() {
        inner.insert("command".to_string(), json!(command));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", err.describe())];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut current = std::error::Error::source(err);
    while let Some(source) = current {
        causes.push(source.to_string());
        current = source.source();
    }
    causes
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
