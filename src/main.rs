use std::{
    env,
    fs::File,
    io::{self, IsTerminal, Read},
    path::Path,
    process,
};

use tabletrace::{
    aes::AccessModel,
    error::Error,
    layout,
    outlog::{self, ExperimentGroup, LogParser},
    stats::{self, GroupSummary},
};

const USAGE: &str = "usage:
    tabletrace eval <key-hex> [out.log[.gz]] [summary.json]
    tabletrace layout    (objdump disassembly on stdin, C source on stdout)";

fn main() {
    let args: Vec<String> = env::args().collect();
    let result = match args.get(1).map(String::as_str) {
        Some("eval") => eval(&args[2..]),
        Some("layout") => generate_layout(),
        _ => {
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn eval(args: &[String]) -> Result<(), Error> {
    let Some(key_hex) = args.first() else {
        eprintln!("{USAGE}");
        process::exit(2);
    };
    let Ok(key) = hex::decode(key_hex)
        .map_err(|_| ())
        .and_then(|key| <[u8; 16]>::try_from(key).map_err(|_| ()))
    else {
        eprintln!("key must be 16 bytes of hex");
        process::exit(2);
    };

    let log_path = args.get(1).map(String::as_str).unwrap_or("out.log");
    let reader = outlog::open_log(Path::new(log_path))?;
    let report = LogParser::new(AccessModel::new(key, [0u8; 16])).parse(reader)?;

    for (label, value) in &report.timestamps {
        println!("Timestamp ({label}): {value}");
    }

    let summaries = stats::summarize(&report.groups)?;
    for (summary, group) in summaries.iter().zip(&report.groups) {
        print!("\n{}", group_report(summary, group));
    }

    if let Some(json_path) = args.get(2) {
        serde_json::to_writer_pretty(File::create(json_path)?, &summaries)?;
    }

    Ok(())
}

/// Console report for one experiment group: the experiment descriptor, its
/// expected bit-vector, a `Match:` line per matching observed state, and the
/// totals.
fn group_report(summary: &GroupSummary, group: &ExperimentGroup) -> String {
    let d = &summary.descriptor;
    let mut out = match d.flipped_bit {
        Some(bit) => format!(
            "LUT {}, dependent byte pos {}, flipped bit {}, anchor PT value {:02x}\n",
            d.table, d.position, bit, d.value
        ),
        None => format!(
            "LUT {}, PT pos {}, value {:02x}\n",
            d.table, d.position, d.value
        ),
    };
    out.push_str(&format!(
        "expected:     {} {:?}\n",
        group.expected,
        group.expected.distances()
    ));
    for state in &group.states {
        if state.matches {
            out.push_str(&format!(
                "Match: {:8} {} {:?}\n",
                state.observed.raw(),
                state.observed,
                state.observed.distances()
            ));
        }
    }
    out.push_str(&format!(
        "states total: {:6} match: {:6} ratio: {}\n",
        summary.total, summary.matches, summary.ratio
    ));
    out
}

fn generate_layout() -> Result<(), Error> {
    let mut stdin = io::stdin();
    if stdin.is_terminal() {
        eprintln!(
            "Pipe the output of\n    objdump --disassemble=mbedtls_internal_aes_encrypt libmbedcrypto.so\ninto this command."
        );
        process::exit(2);
    }
    let mut disasm = String::new();
    stdin.read_to_string(&mut disasm)?;

    let addresses = layout::extract_load_addresses(&disasm)?;
    let targets = layout::target_positions(&addresses);
    for (target, address) in targets.iter().zip(&addresses) {
        eprintln!("Position(\"{}\", {:x})", target.label, address);
    }

    let functions = layout::synthesize(targets)?;
    print!("{}", layout::render(&functions));

    Ok(())
}
