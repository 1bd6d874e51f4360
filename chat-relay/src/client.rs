use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    codec::{Frame, read_frame, write_frame},
    error::{RelayError, RelayResult},
    protocol::NAME_REQUEST,
};

type Incoming = RelayResult<Option<Bytes>>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;
    let (incoming_tx, mut incoming) = mpsc::channel(64);
    let reader_task = spawn_frame_reader(reader, args.max_frame_bytes, incoming_tx);

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let outcome = run_client_loop(&mut incoming, &mut writer, &mut stdin, &mut input, &args).await;
    reader_task.abort();
    shutdown_connection(&mut writer).await;

    outcome
}

async fn establish_connection(args: &ClientArgs) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);
    Ok(stream.into_split())
}

/// Frames are read on their own task: `read_frame` cannot be cancelled
/// mid-frame without losing bytes, but a channel receive can.
fn spawn_frame_reader(
    reader: OwnedReadHalf,
    max_frame_len: usize,
    incoming: mpsc::Sender<Incoming>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            let frame = read_frame(&mut reader, max_frame_len).await;
            let finished = !matches!(frame, Ok(Some(_)));
            if incoming.send(frame).await.is_err() || finished {
                break;
            }
        }
    })
}

async fn run_client_loop(
    incoming: &mut mpsc::Receiver<Incoming>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    args: &ClientArgs,
) -> Result<()> {
    loop {
        select! {
            frame = incoming.recv() => {
                if !handle_server_frame(frame, writer, &args.nickname).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                let keep_going = handle_stdin_input(bytes_read, input, writer).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(
    frame: Option<Incoming>,
    writer: &mut OwnedWriteHalf,
    nickname: &str,
) -> Result<bool> {
    match frame {
        Some(Ok(Some(payload))) if payload.as_ref() == NAME_REQUEST.as_bytes() => {
            send_text(writer, nickname).await?;
            Ok(true)
        }
        Some(Ok(Some(payload))) => {
            if !payload.is_empty() {
                write_stdout(&String::from_utf8_lossy(&payload)).await?;
            }
            Ok(true)
        }
        None | Some(Ok(None)) | Some(Err(RelayError::ConnectionClosed)) => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Some(Err(error)) => Err(error.into()),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    send_text(writer, text).await?;
    Ok(true)
}

async fn send_text(writer: &mut OwnedWriteHalf, text: &str) -> Result<()> {
    let frame = Frame::encode(text)?;
    write_frame(writer, &frame)
        .await
        .context("failed to send frame")
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// Half-closes the connection, which the relay treats as leaving the chat.
async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
