//! Minimal inspector CLI: open a database and dump a summary or a
//! single key. Not part of the core library surface (§1 out-of-scope
//! "CLI inspector") — kept as a thin wrapper over the public API for
//! manual debugging during development.

use std::env;
use std::process::ExitCode;

use rdb::{Attributes, OpenFlags, Tdb};

fn usage() -> ! {
    eprintln!("usage: rdb-tool <path> [dump|get <key>|check]");
    std::process::exit(2);
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage();
    }

    let path = &args[1];
    let flags = OpenFlags {
        read_only: true,
        create: false,
    };
    let db = match Tdb::open(path, flags, Attributes::default()) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("failed to open {path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    match args[2].as_str() {
        "dump" => {
            let result = db.traverse(|key, data| {
                println!("{} => {} bytes", String::from_utf8_lossy(key), data.len());
                Ok(())
            });
            match result {
                Ok(n) => {
                    println!("{n} records, seqnum={}", db.sequence_number());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("traverse failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        "get" => {
            let Some(key) = args.get(3) else { usage() };
            match db.fetch(key.as_bytes()) {
                Ok(Some(data)) => {
                    println!("{}", String::from_utf8_lossy(&data));
                    ExitCode::SUCCESS
                }
                Ok(None) => {
                    eprintln!("no such key");
                    ExitCode::FAILURE
                }
                Err(e) => {
                    eprintln!("fetch failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        "check" => match db.check() {
            Ok(()) => {
                println!("ok");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("check failed: {e}");
                ExitCode::FAILURE
            }
        },
        _ => usage(),
    }
}
