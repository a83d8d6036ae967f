use spop_agent::SPOP_VERSION;
use spop_frame::MAX_FRAME_SIZE;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("spop {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: spop");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("protocol: SPOP/{SPOP_VERSION}");
    println!("max_frame_size: {MAX_FRAME_SIZE}");
    println!(
        "build_target: {}",
        option_env!("SPOP_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "rustc: {}",
        option_env!("RUSTC_VERSION").unwrap_or("unknown")
    );
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));

    Ok(SUCCESS)
}
