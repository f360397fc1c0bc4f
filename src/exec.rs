//! Child process helpers shared by buildpacks and one-shot jobs

use tokio::io::{AsyncBufReadExt, BufReader};

/// Stream stdout+stderr from a child process, calling `on_output` for each line.
///
/// Returns all collected output lines. Streams that were not piped are
/// skipped.
pub(crate) async fn stream_child_output(
    child: &mut tokio::process::Child,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> Vec<String> {
    let mut all_output = Vec::new();

    let mut stderr_reader = child.stderr.take().map(|s| BufReader::new(s).lines());
    let mut stdout_reader = child.stdout.take().map(|s| BufReader::new(s).lines());

    let mut stderr_done = stderr_reader.is_none();
    let mut stdout_done = stdout_reader.is_none();

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = next_line(&mut stderr_reader), if !stderr_done => {
                match line {
                    Some(line) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    None => stderr_done = true,
                }
            }
            line = next_line(&mut stdout_reader), if !stdout_done => {
                match line {
                    Some(line) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    None => stdout_done = true,
                }
            }
        }
    }

    all_output
}

async fn next_line<R>(reader: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match reader {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}
