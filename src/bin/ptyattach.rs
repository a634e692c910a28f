//! A thin reference client for the daemon, analogous to `socat`: puts the
//! controlling terminal in raw mode, forwards stdin as `Input` frames,
//! forwards terminal resizes as `Resize` frames, and writes whatever the
//! daemon sends straight to stdout. Not a display frontend — it does not
//! drive a screen buffer, it just passes bytes through.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use ptymaster::client::PtyClient;
use ptymaster::daemon::DEFAULT_SOCKET_PATH;

#[derive(Parser, Debug)]
#[command(name = "ptyattach", version, about)]
struct Cli {
    /// Session id to attach to.
    #[arg(long, default_value = "default")]
    session: String,

    /// Path to the daemon's Unix socket.
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("ptyattach: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> io::Result<()> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let sink = move |data: &[u8]| {
        let _ = tx.send(data.to_vec());
    };

    let mut client = PtyClient::connect(&cli.socket, &cli.session, sink)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

    enable_raw_mode()?;
    let result = interact(&mut client, rx);
    let _ = disable_raw_mode();
    client.disconnect();
    result
}

fn interact(client: &mut PtyClient, rx: mpsc::Receiver<Vec<u8>>) -> io::Result<()> {
    let mut last_size = crossterm::terminal::size().unwrap_or((80, 24));
    let _ = client.send_resize(last_size.1, last_size.0);

    let stdin_rx = spawn_stdin_reader();

    loop {
        if let Ok(size) = crossterm::terminal::size() {
            if size != last_size {
                last_size = size;
                let _ = client.send_resize(size.1, size.0);
            }
        }

        if let Ok(data) = rx.try_recv() {
            io::stdout().write_all(&data)?;
            io::stdout().flush()?;
        }

        match stdin_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(bytes) => {
                if bytes.is_empty() {
                    break; // stdin closed
                }
                let text = String::from_utf8_lossy(&bytes);
                if client.send_input(&text).is_err() {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match io::stdin().read(&mut buf) {
                Ok(0) => {
                    let _ = tx.send(Vec::new());
                    break;
                }
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}
