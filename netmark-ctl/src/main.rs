use std::process;

use netmark_lib::socket;

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let args = cli::parse();

    let command = args.command.join(" ");
    let replies = match socket::process_cmd(&args.socket_path, &args.cookie, &command) {
        Ok(replies) => replies,
        Err(e) => {
            eprintln!("Error processing `{command}`: {e}");
            process::exit(exitcode::UNAVAILABLE);
        }
    };

    let mut exit = exitcode::OK;
    for line in &replies {
        println!("{line}");
        if let Some(code) = line.split_whitespace().next().and_then(|c| c.parse::<u16>().ok()) {
            if code >= 400 {
                exit = exitcode::PROTOCOL;
            }
        }
    }

    process::exit(exit);
}
