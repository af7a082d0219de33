use std::io::{self, BufRead, Write};

/// Print `message` and block until the operator presses enter.
///
/// A closed stdin counts as confirmation so the tool can run unattended
/// with input redirected from `/dev/null`.
pub fn wait_for_enter(message: &str) -> io::Result<()> {
    println!("{message}");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}
