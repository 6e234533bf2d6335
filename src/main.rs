use std::convert::Infallible;
use std::io::Write;
use std::{env, process::exit};

use tracing_subscriber::EnvFilter;
use zeroize::Zeroize;

use keyed::{keystream, passphrase, tracee, Session};

struct Opts {
    /// Whether to log each intercepted syscall.
    verbose: bool,

    /// Read the passphrase from this file instead of prompting.
    keyfile: Option<String>,

    /// Number of confirmation re-entries when prompting.
    confirmations: usize,

    /// Value returned from getpid() when interception is enabled.
    fake_pid: Option<i64>,

    /// The command to run and its arguments.
    command: Vec<String>,
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let opts = parse_opts(&args);
    if opts.command.is_empty() {
        usage(&mut std::io::stderr());
        exit(1);
    }

    setup_logging(opts.verbose);

    match run(&opts) {
        Ok(never) => match never {},
        Err(err) => {
            eprintln!("keyed: {err}");
            exit(1);
        }
    }
}

fn run(opts: &Opts) -> keyed::Result<Infallible> {
    let mut passphrase = match &opts.keyfile {
        Some(path) => passphrase::read_keyfile(path)?,
        None => passphrase::prompt(opts.confirmations)?,
    };
    // The passphrase is zeroised whether or not derivation succeeds.
    let key = keystream::derive(&passphrase);
    passphrase.zeroize();
    let key = key?;

    let pid = tracee::spawn(&opts.command)?;
    Session::new(key, opts.fake_pid, pid).run()
}

fn parse_opts(args: &[String]) -> Opts {
    let mut opts = Opts {
        verbose: false,
        keyfile: None,
        confirmations: 1,
        fake_pid: None,
        command: Vec::new(),
    };
    let mut i = 1; // Skip program name
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-h" => {
                usage(&mut std::io::stdout());
                exit(0);
            }
            "-v" => {
                opts.verbose = true;
                i += 1;
            }
            "-k" | "-n" => {
                if i + 1 >= args.len() {
                    eprintln!("keyed: option {arg} requires a value");
                    exit(1);
                }
                let value = &args[i + 1];
                if arg == "-k" {
                    opts.keyfile = Some(value.clone());
                } else {
                    opts.confirmations = parse_number(value);
                }
                i += 2;
            }
            "-p" => {
                opts.fake_pid = Some(2);
                i += 1;
            }
            "--" => {
                opts.command = args[i + 1..].to_vec();
                break;
            }
            _ if arg.starts_with("-k") => {
                opts.keyfile = Some(arg[2..].to_string());
                i += 1;
            }
            _ if arg.starts_with("-n") => {
                opts.confirmations = parse_number(&arg[2..]);
                i += 1;
            }
            _ if arg.starts_with("-p") => {
                opts.fake_pid = Some(parse_number(&arg[2..]));
                i += 1;
            }
            _ if arg.starts_with('-') => {
                usage(&mut std::io::stderr());
                exit(1);
            }
            _ => {
                opts.command = args[i..].to_vec();
                break;
            }
        }
    }
    opts
}

fn parse_number<T: std::str::FromStr>(value: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("keyed: invalid number: {value}");
        exit(1);
    })
}

fn usage(out: &mut dyn Write) {
    let _ = writeln!(out, "usage: keyed [-hv] [-n n] [-k file] [-p[pid]] command [args]");
    let _ = writeln!(out, "  -h        print this message");
    let _ = writeln!(out, "  -k file   read passphrase from a file");
    let _ = writeln!(out, "  -n int    number of times to repeat passphrase prompt (1)");
    let _ = writeln!(out, "  -p[pid]   also intercept getpid() syscalls (2)");
    let _ = writeln!(out, "  -v        verbose messages");
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("keyed=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
