//! Line-oriented console front-end.
//!
//! Every input line is either a command or a chat message for the console's
//! conversation. Streamed replies are printed as they grow.

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info};

use crate::config::ConsoleConfig;
use crate::context::ContextMessage;
use crate::error::format_error_chain;
use crate::imagegen::{GeneratedImage, ImageOverrides};
use crate::service::RelayService;

/// Separates the positive and negative prompt of `/image`
const NEGATIVE_PROMPT_SEPARATOR: &str = "||";

/// One parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    Image(ImageOverrides),
    Reset,
    Quit,
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }

        match line.split_once(char::is_whitespace) {
            None if line == "/reset" => Command::Reset,
            None if line == "/quit" => Command::Quit,
            None if line == "/image" => Command::Image(ImageOverrides::default()),
            Some(("/image", rest)) => Command::Image(parse_image_request(rest)),
            _ => Command::Chat(line.to_string()),
        }
    }
}

fn parse_image_request(rest: &str) -> ImageOverrides {
    match rest.split_once(NEGATIVE_PROMPT_SEPARATOR) {
        Some((positive, negative)) => ImageOverrides {
            positive_prompt: positive.trim().to_string(),
            negative_prompt: Some(negative.trim().to_string()),
            ..Default::default()
        },
        None => ImageOverrides::prompt(rest.trim()),
    }
}

/// Turns cumulative updates into the text not printed yet
#[derive(Debug, Default)]
pub struct DeltaPrinter {
    printed: String,
}

impl DeltaPrinter {
    /// The part of `cumulative` after what has already been printed.
    ///
    /// When an update rewrites earlier text only the part after the common
    /// prefix is returned; printed text is never retracted.
    pub fn delta<'a>(&mut self, cumulative: &'a str) -> &'a str {
        let common = common_prefix_len(&self.printed, cumulative);
        let delta = &cumulative[common..];
        self.printed.truncate(common);
        self.printed.push_str(delta);
        delta
    }

    pub fn reset(&mut self) {
        self.printed.clear();
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, x), y)| x != y)
        .map(|((at, _), _)| at)
        .unwrap_or_else(|| a.len().min(b.len()))
}

/// Write images into `dir`, numbering them to keep names unique
pub fn save_images(dir: &Path, images: &[GeneratedImage]) -> std::io::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;

    let mut paths = Vec::with_capacity(images.len());
    for (index, image) in images.iter().enumerate() {
        let base = Path::new(&image.filename)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.png".to_string());
        let path = dir.join(format!("{}-{}", index + 1, base));
        std::fs::write(&path, &image.bytes)?;
        paths.push(path);
    }

    Ok(paths)
}

/// Run the console on stdin/stdout until `/quit` or end of input
pub async fn run(service: &RelayService, config: &ConsoleConfig) -> std::io::Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    run_with(service, config, stdin, &mut stdout).await
}

pub async fn run_with<R, W>(
    service: &RelayService,
    config: &ConsoleConfig,
    input: R,
    output: &mut W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();
    let mut printer = DeltaPrinter::default();

    writeln!(output, "Type a message, /image <prompt> [|| <negative>], /reset or /quit.")?;
    output.flush()?;

    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Command::Empty => continue,
            Command::Quit => break,
            Command::Reset => {
                service.reset_conversation(&config.conversation_id);
                writeln!(output, "[conversation cleared]")?;
            }
            Command::Image(overrides) => {
                generate_images(service, config, &overrides, output).await?;
            }
            Command::Chat(text) => {
                let message = ContextMessage::from_user(&config.user_id, &config.user_name, text);
                printer.reset();

                let mut write_failure = None;
                let result = service
                    .chat(&config.conversation_id, message, |update| {
                        print_update(output, printer.delta(update), &mut write_failure);
                    })
                    .await;
                if let Some(e) = write_failure {
                    return Err(e);
                }

                match result {
                    Ok(reply) => writeln!(output, "{}", printer.delta(&reply))?,
                    Err(e) => {
                        let message = format_error_chain(&e);
                        error!(error = %message, "Chat request failed");
                        writeln!(output, "\n[error] {}", message)?;
                    }
                }
            }
        }
        output.flush()?;
    }

    info!("Console closed");
    Ok(())
}

/// Print one streamed delta. After the first failure nothing more is written.
fn print_update<W: Write>(output: &mut W, text: &str, failure: &mut Option<std::io::Error>) {
    if failure.is_some() {
        return;
    }
    if let Err(e) = write!(output, "{}", text).and_then(|_| output.flush()) {
        *failure = Some(e);
    }
}

async fn generate_images<W: Write>(
    service: &RelayService,
    config: &ConsoleConfig,
    overrides: &ImageOverrides,
    output: &mut W,
) -> std::io::Result<()> {
    if overrides.positive_prompt.is_empty() {
        writeln!(output, "[error] /image needs a prompt")?;
        return Ok(());
    }

    writeln!(output, "[generating image]")?;
    output.flush()?;

    let images = match service.generate_images(overrides).await {
        Ok(images) => images,
        Err(e) => {
            let message = format_error_chain(&e);
            error!(error = %message, "Image generation failed");
            writeln!(output, "[error] {}", message)?;
            return Ok(());
        }
    };

    match save_images(&config.output_dir, &images) {
        Ok(paths) => {
            for path in paths {
                writeln!(output, "[image] {}", path.display())?;
            }
        }
        Err(e) => {
            error!(error = %e, dir = %config.output_dir.display(), "Failed to save images");
            writeln!(output, "[error] failed to save images: {}", e)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::gradio::invocation::test_support::{handshake, push, serve};
    use bytes::Bytes;
    use serde_json::json;
    use std::io::{Error, ErrorKind};

    /// Accepts writes until it is asked to write `fail_on`
    struct BrokenPipeAt {
        written: Vec<u8>,
        fail_on: &'static str,
    }

    impl Write for BrokenPipeAt {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if buf == self.fail_on.as_bytes() {
                return Err(Error::new(ErrorKind::BrokenPipe, "closed"));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("  "), Command::Empty);
        assert_eq!(Command::parse("/quit"), Command::Quit);
        assert_eq!(Command::parse(" /reset "), Command::Reset);
        assert_eq!(
            Command::parse("hello there"),
            Command::Chat("hello there".to_string())
        );
        assert_eq!(
            Command::parse("/reset please"),
            Command::Chat("/reset please".to_string())
        );
        assert_eq!(
            Command::parse("/image"),
            Command::Image(ImageOverrides::default())
        );
        assert_eq!(
            Command::parse("/image a red fox"),
            Command::Image(ImageOverrides::prompt("a red fox"))
        );
        assert_eq!(
            Command::parse("/image castle at dusk || blurry, text"),
            Command::Image(ImageOverrides {
                positive_prompt: "castle at dusk".to_string(),
                negative_prompt: Some("blurry, text".to_string()),
                ..Default::default()
            })
        );
    }

    #[test]
    fn test_delta_printer_prints_new_suffix() {
        let mut printer = DeltaPrinter::default();
        assert_eq!(printer.delta("H"), "H");
        assert_eq!(printer.delta("He"), "e");
        assert_eq!(printer.delta("Hello"), "llo");
        assert_eq!(printer.delta("Hello"), "");
        assert_eq!(printer.delta("Hello, wörld"), ", wörld");
    }

    #[test]
    fn test_delta_printer_after_rewrite() {
        let mut printer = DeltaPrinter::default();
        assert_eq!(printer.delta("Hello\n"), "Hello\n");
        assert_eq!(printer.delta("Hello"), "");
        assert_eq!(printer.delta("Help"), "p");

        printer.reset();
        assert_eq!(printer.delta("New"), "New");
    }

    #[test]
    fn test_save_images() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("images");
        let images = vec![
            GeneratedImage {
                filename: "/tmp/outputs/grid.png".to_string(),
                bytes: Bytes::from_static(b"one"),
            },
            GeneratedImage {
                filename: "/tmp/other/grid.png".to_string(),
                bytes: Bytes::from_static(b"two"),
            },
        ];

        let paths = save_images(&out, &images).unwrap();

        assert_eq!(paths, vec![out.join("1-grid.png"), out.join("2-grid.png")]);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"one");
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_console_reset_and_quit() {
        let service = RelayService::new(RelayConfig::default()).unwrap();
        let config = RelayConfig::default().console;
        service
            .context(&config.conversation_id)
            .lock()
            .unwrap()
            .add_message(ContextMessage::from_user("u", "U", "earlier"));

        let input: &[u8] = b"\n/reset\n/quit\nnever sent\n";
        let mut output = Vec::new();
        run_with(&service, &config, input, &mut output).await.unwrap();

        let printed = String::from_utf8(output).unwrap();
        assert!(printed.contains("[conversation cleared]"));
        assert!(
            service
                .context(&config.conversation_id)
                .lock()
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_console_reports_errors_and_continues() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let host = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut relay_config = RelayConfig::default();
        relay_config.textgen.host = host;
        let service = RelayService::new(relay_config).unwrap();
        let config = RelayConfig::default().console;

        let input: &[u8] = b"hello\n/image\n/reset\n";
        let mut output = Vec::new();
        run_with(&service, &config, input, &mut output).await.unwrap();

        let printed = String::from_utf8(output).unwrap();
        assert!(printed.contains("[error] Failed to connect to"));
        assert!(printed.contains("[error] /image needs a prompt"));
        assert!(printed.contains("[conversation cleared]"));
    }

    #[test]
    fn test_print_update_keeps_first_failure() {
        let mut output = BrokenPipeAt {
            written: Vec::new(),
            fail_on: "b",
        };
        let mut failure = None;

        print_update(&mut output, "a", &mut failure);
        assert!(failure.is_none());
        print_update(&mut output, "b", &mut failure);
        print_update(&mut output, "c", &mut failure);

        assert_eq!(failure.map(|e| e.kind()), Some(ErrorKind::BrokenPipe));
        assert_eq!(output.written, b"a");
    }

    #[tokio::test]
    async fn test_console_returns_stream_write_error() {
        let mut prime = handshake();
        prime.push(push(
            json!({"msg": "process_completed", "output": {"data": [""]}, "success": true}),
        ));
        let mut generate = handshake();
        generate.push(push(json!({
            "msg": "process_generating",
            "output": {"data": ["### Human: hi\n### Assistant: Hey"]}
        })));
        generate.push(push(json!({
            "msg": "process_completed",
            "output": {"data": ["### Human: hi\n### Assistant: Hey there\n### Human:"]},
            "success": true
        })));
        let (host, server) = serve(vec![prime, generate]).await;

        let mut relay_config = RelayConfig::default();
        relay_config.textgen.host = host;
        let service = RelayService::new(relay_config).unwrap();
        let config = RelayConfig::default().console;

        let input: &[u8] = b"hi\nnever read\n";
        let mut output = BrokenPipeAt {
            written: Vec::new(),
            fail_on: "Hey",
        };
        let err = run_with(&service, &config, input, &mut output)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
        assert_eq!(
            service
                .context(&config.conversation_id)
                .lock()
                .unwrap()
                .len(),
            2
        );
        server.await.unwrap();
    }
}
