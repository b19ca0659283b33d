use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use luabridge::{BridgeConfig, DynamicAccess, Function, HostObject, Lua, Object, State, Value};

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG: &str = "luabridge.toml";

#[derive(Parser)]
#[command(name = "luabridge")]
#[command(about = "Run Lua scripts against host bindings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Lua source file
    Run {
        /// The source file to run
        file: Option<PathBuf>,

        /// Arguments to pass to the script
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        script_args: Vec<String>,

        /// Execute code directly from command line
        #[arg(short = 'c', long)]
        code: Option<String>,

        /// Config file (defaults to ./luabridge.toml if present)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Print returned values as JSON
        #[arg(long)]
        json: bool,

        /// Log everything, including callback dispatch
        #[arg(long)]
        trace: bool,
    },
    /// Evaluate an expression and print its value
    Eval {
        expr: String,

        /// Config file (defaults to ./luabridge.toml if present)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Print the value as JSON
        #[arg(long)]
        json: bool,
    },
}

/// The global object scripts use to reach the host.
struct HostGlobal {
    args: Vec<String>,
    title: String,
    log: Function,
}

impl HostGlobal {
    fn new(args: Vec<String>) -> Self {
        Self {
            args,
            title: "luabridge".to_string(),
            log: Function::new(log_values),
        }
    }
}

impl DynamicAccess for HostGlobal {
    fn get(&self, key: &str) -> Value {
        match key {
            "args" => Value::array(self.args.iter().map(|a| Value::from(a.as_str())).collect()),
            "title" => Value::from(self.title.as_str()),
            "log" => Value::Function(self.log.clone()),
            _ => Value::Nil,
        }
    }

    fn set(&mut self, key: &str, value: Value) {
        if key == "title" {
            self.title = value.to_string();
        }
    }
}

impl HostObject for HostGlobal {}

/// `host.log(...)`: print the decoded arguments, tab separated.
fn log_values(state: &State) -> i32 {
    let line: Vec<String> = (1..=state.get_top())
        .map(|i| state.to_value(i).to_string())
        .collect();
    println!("{}", line.join("\t"));
    0
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig, String> {
    match path {
        Some(p) => BridgeConfig::load(p).map_err(|e| e.to_string()),
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.exists() {
                BridgeConfig::load(default).map_err(|e| e.to_string())
            } else {
                Ok(BridgeConfig::default())
            }
        }
    }
}

/// Open an instance with the host global and configured globals installed.
fn open_runtime(config: &BridgeConfig, args: Vec<String>) -> Lua {
    let lua = if config.open_libs {
        Lua::with_libs()
    } else {
        Lua::open()
    };

    lua.push_value(&Value::Object(Object::new(HostGlobal::new(args))));
    lua.set_global(&config.global_name);
    for (name, value) in config.global_values() {
        lua.push_table(&value);
        lua.set_global(&name);
    }
    lua
}

fn print_results(results: &[Value], json: bool) {
    if results.is_empty() {
        return;
    }
    if json {
        for value in results {
            println!("{}", value.to_json());
        }
    } else {
        let line: Vec<String> = results.iter().map(|v| v.to_string()).collect();
        println!("{}", line.join("\t"));
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            script_args,
            code,
            config,
            json,
            trace,
        } => {
            let config = match load_config(config.as_deref()) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            luabridge::logging::init(if trace {
                log::LevelFilter::Trace
            } else {
                config.level()
            });

            let run_result = if let Some(source) = code {
                let mut cli_args = vec!["<code>".to_string()];
                cli_args.extend(script_args);
                open_runtime(&config, cli_args).exec(&source)
            } else if let Some(path) = file {
                let mut cli_args = vec![path.to_string_lossy().to_string()];
                cli_args.extend(script_args);
                open_runtime(&config, cli_args).exec_file(&path)
            } else {
                eprintln!("error: no file specified");
                eprintln!("usage: luabridge run <file> or luabridge run -c <code>");
                return ExitCode::FAILURE;
            };

            match run_result {
                Ok(results) => print_results(&results, json),
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
        Commands::Eval { expr, config, json } => {
            let config = match load_config(config.as_deref()) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            luabridge::logging::init(config.level());

            match open_runtime(&config, Vec::new()).exec(&format!("return {}", expr)) {
                Ok(results) => print_results(&results, json),
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    ExitCode::SUCCESS
}
