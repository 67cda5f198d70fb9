//! CLI subcommand: `pinguard paths`
//!
//! Prints all resolved paths for debugging and scripting.

use anyhow::Result;

use crate::paths::Paths;

pub fn run() -> Result<()> {
    let paths = Paths::resolve()?;

    println!("PinGuard Paths");
    println!("==============");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  engine state:   {}", paths.state_file().display());
    println!("  audit log:      {}", paths.audit_log().display());
    println!();
    match paths.runtime_dir {
        Some(ref dir) => println!("Runtime:    {}", dir.display()),
        None => println!("Runtime:    (not available)"),
    }
    println!("  instance lock:  {}", paths.instance_lock().display());

    Ok(())
}
