use std::path::PathBuf;

use keeper_core::config;

pub(crate) fn run_config_generate(dest: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let path = match dest {
        Some(d) => PathBuf::from(d),
        None => pick_config_location()?,
    };

    if path.exists() {
        return Err(format!("file already exists: {}", path.display()).into());
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    std::fs::write(&path, config::minimal_config_template())?;
    println!("Config written to: {}", path.display());
    println!("Edit it to set storage.local.base_path and the source commands.");
    println!("Then run `keeper verify` to check that everything is reachable.");
    Ok(())
}

fn pick_config_location() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let search_paths = config::default_config_search_paths();

    eprintln!("Where should the config file live?");
    for (i, (path, level)) in search_paths.iter().enumerate() {
        let hint = match *level {
            "project" => "next to a deployment, checked into version control",
            "user" => "backups run from your own account",
            _ => "a host-wide daemon run by systemd or root",
        };
        eprintln!("  [{}] {level:8} {}", i + 1, path.display());
        eprintln!("      {hint}");
    }
    eprint!("Choice [1]: ");
    std::io::Write::flush(&mut std::io::stderr())?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let index = parse_choice(input.trim(), search_paths.len())?;
    Ok(search_paths[index].0.clone())
}

/// One-based menu choice to an index. Empty input picks the first entry.
fn parse_choice(input: &str, options: usize) -> Result<usize, String> {
    if input.is_empty() {
        return Ok(0);
    }
    let n: usize = input
        .parse()
        .map_err(|_| format!("invalid choice: '{input}'"))?;
    if n == 0 || n > options {
        return Err(format!("choice out of range: {n}"));
    }
    Ok(n - 1)
}
