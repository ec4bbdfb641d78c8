use partmut::config::MutationSettings;
use partmut::offline;
use std::path::PathBuf;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "parts" => match args.get(2).map(String::as_str) {
            Some("list") => cmd_parts_list(&args[3..]),
            Some("verify") => cmd_parts_verify(&args[3..]),
            Some("clean") => cmd_parts_clean(&args[3..]),
            Some(other) => Err(format!("unknown parts command: {other}")),
            None => Err("missing parts subcommand".into()),
        },
        "settings" => match args.get(2).map(String::as_str) {
            Some("check") => cmd_settings_check(&args[3..]),
            Some(other) => Err(format!("unknown settings command: {other}")),
            None => Err("missing settings subcommand".into()),
        },
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn table_dir(args: &[String]) -> Result<PathBuf, String> {
    parse_flag_value(args, "--table-dir")
        .map(PathBuf::from)
        .ok_or_else(|| "--table-dir is required".to_string())
}

fn cmd_parts_list(args: &[String]) -> Result<(), String> {
    let dir = table_dir(args)?;
    let report = offline::list_parts(&dir).map_err(|e| e.to_string())?;
    if args.iter().any(|a| a == "--json") {
        let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{json}");
        return Ok(());
    }
    for part in &report.parts {
        println!(
            "{}\t{}\t{}\t{}{}",
            part.name,
            part.rows,
            part.bytes,
            part.columns.join(","),
            if part.superseded { "\tSUPERSEDED" } else { "" }
        );
    }
    for name in &report.temporary {
        println!("{name}\tTEMPORARY");
    }
    for (name, reason) in &report.invalid {
        println!("{name}\tINVALID\t{reason}");
    }
    Ok(())
}

fn cmd_parts_verify(args: &[String]) -> Result<(), String> {
    let dir = table_dir(args)?;
    let report = offline::verify_parts(&dir).map_err(|e| e.to_string())?;
    println!(
        "ok={}\tparts={}\tfiles={}",
        report.ok, report.parts_checked, report.files_checked
    );
    for v in &report.violations {
        println!("violation\t{v}");
    }
    if report.ok {
        Ok(())
    } else {
        Err("checksum violations found".into())
    }
}

fn cmd_parts_clean(args: &[String]) -> Result<(), String> {
    let dir = table_dir(args)?;
    let removed = offline::remove_temporary_parts(&dir).map_err(|e| e.to_string())?;
    for name in &removed {
        println!("removed\t{name}");
    }
    Ok(())
}

fn cmd_settings_check(args: &[String]) -> Result<(), String> {
    let path = parse_flag_value(args, "--file").ok_or("--file is required")?;
    let settings =
        MutationSettings::from_json_file(&PathBuf::from(path)).map_err(|e| e.to_string())?;
    println!("{settings:?}");
    Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    for idx in 0..args.len() {
        if args[idx] == flag {
            return args.get(idx + 1).cloned();
        }
    }
    None
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  partmut parts list --table-dir <dir> [--json]");
    eprintln!("  partmut parts verify --table-dir <dir>");
    eprintln!("  partmut parts clean --table-dir <dir>");
    eprintln!("  partmut settings check --file <mutation-settings.json>");
}
