use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    // `v0.3.1-4-gabc1234-dirty` inside a checkout, the crate version elsewhere
    let describe = git(&["describe", "--tags", "--always", "--dirty"])
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    let build_date = chrono::Utc::now().format("%Y-%m-%d");

    println!(
        "cargo:rustc-env=PEERTUNNEL_VERSION={} (built {})",
        describe, build_date
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");
}
