// Leveled logging in the shape of the original `logger` package: three
// levels, gated on a verbosity flag threaded through `Config` rather than a
// package-level global.

/// Prints an informational line, but only when `verbose` is set.
pub fn info(verbose: bool, msg: &str) {
    if verbose {
        eprintln!("[+] {msg}");
    }
}

/// Prints a warning. Always shown.
pub fn warn(msg: &str) {
    eprintln!("[!] {msg}");
}

/// Prints a success/status line. Always shown.
pub fn success(msg: &str) {
    eprintln!("[*] {msg}");
}
