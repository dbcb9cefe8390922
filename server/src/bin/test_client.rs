use bincode::{deserialize, serialize};
use clap::Parser;
use rand::Rng;
use shared::{Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

/// Joins the server, wanders around, chats, and leaves.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,
    /// Name to join as
    #[clap(short, long, default_value = "tester")]
    name: String,
    /// Number of random moves to send
    #[clap(short, long, default_value = "10")]
    moves: u32,
}

async fn send(socket: &UdpSocket, packet: &Packet, server: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let data = serialize(packet)?;
    socket.send_to(&data, server).await?;
    Ok(())
}

/// Waits for the next packet that is not a tick broadcast. Ticks carry no
/// chat history.
async fn reply(socket: &UdpSocket, buf: &mut [u8]) -> Result<Option<Packet>, Box<dyn std::error::Error>> {
    loop {
        let Ok(received) = timeout(Duration::from_secs(2), socket.recv_from(buf)).await else {
            return Ok(None);
        };
        let (len, _) = received?;
        match deserialize::<Packet>(&buf[..len])? {
            Packet::State {
                recent_messages, ..
            } if recent_messages.is_empty() => continue,
            packet => return Ok(Some(packet)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Create local socket
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);
    let mut buf = [0u8; 2048];

    println!("Joining {} as {}", args.server, args.name);
    send(
        &socket,
        &Packet::Join {
            client_version: PROTOCOL_VERSION,
            name: args.name.clone(),
        },
        args.server,
    )
    .await?;

    match reply(&socket, &mut buf).await? {
        Some(Packet::Joined { user_id, object_id }) => {
            println!("Joined as user {} with object {}", user_id, object_id);
        }
        Some(other) => {
            println!("Expected Joined but got: {:?}", other);
            return Ok(());
        }
        None => {
            println!("No answer from server");
            return Ok(());
        }
    }

    for i in 0..args.moves {
        let (dx, dy) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-20.0..20.0), rng.gen_range(-20.0..20.0))
        };
        send(&socket, &Packet::Move { dx, dy }, args.server).await?;

        if i % 5 == 4 {
            send(
                &socket,
                &Packet::Say {
                    text: format!("{} made {} moves", args.name, i + 1),
                },
                args.server,
            )
            .await?;
        }
        sleep(Duration::from_millis(200)).await;
    }

    send(&socket, &Packet::RequestState, args.server).await?;
    while let Some(packet) = reply(&socket, &mut buf).await? {
        match packet {
            Packet::State {
                tick,
                objects,
                recent_messages,
            } => {
                println!("State at tick {}:", tick);
                for object in objects {
                    println!("  Object {}: ({:.1}, {:.1})", object.id, object.x, object.y);
                }
                for message in recent_messages {
                    println!("  #{} <{}> {}", message.seq, message.author, message.text);
                }
                break;
            }
            Packet::Chat { message } => println!("Chat #{}: {}", message.seq, message.text),
            Packet::Rejected { reason } => println!("Rejected: {}", reason),
            other => println!("Unexpected packet: {:?}", other),
        }
    }

    println!("Leaving");
    send(&socket, &Packet::Leave, args.server).await?;
    if let Some(packet) = reply(&socket, &mut buf).await? {
        println!("Server answered: {:?}", packet);
    }

    println!("Test client finished");
    Ok(())
}
