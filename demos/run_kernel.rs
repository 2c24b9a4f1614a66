//! An interactive console that starts a kernel and executes input on it.

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use burlap::client::ExecutionState;
use burlap::context::ClientContext;
use burlap::manager::{KernelManager, ManagerConfig};
use burlap::wire_protocol::{
    ErrorReply, ExecuteRequest, ExecuteResult, Message, MessageType, Stream,
};

fn print_output(message: &Message) {
    match message.header.msg_type {
        MessageType::Stream => {
            if let Ok(stream) = message.clone().into_typed::<Stream>() {
                if stream.content.name == "stdout" {
                    print!("{}", stream.content.text);
                } else {
                    eprint!("{}", stream.content.text);
                }
            }
        }
        MessageType::ExecuteResult => {
            if let Ok(result) = message.clone().into_typed::<ExecuteResult>() {
                if let Some(text) = result.content.data.get("text/plain") {
                    println!("-> {}", text.as_str().unwrap_or_default());
                }
            }
        }
        MessageType::Error => {
            if let Ok(error) = message.clone().into_typed::<ErrorReply>() {
                for line in &error.content.traceback {
                    eprintln!("{line}");
                }
            }
        }
        _ => (),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let context = ClientContext::new();
    let kernels = context.kernelspecs().find_kernel_specs().await;

    println!("Available kernels:");
    for (name, path) in &kernels {
        println!("  {:16} {}", name, path.display());
    }

    let (name, spec) = loop {
        print!("\nPick a kernel: ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        let input = input.trim();
        match context.kernelspecs().get_kernel_spec(input).await {
            Ok((dir, spec)) => break (input.to_string(), (dir, spec)),
            Err(err) => println!("{err}, try again"),
        }
    };
    let (resource_dir, spec) = spec;

    let manager = KernelManager::new(
        name,
        spec,
        Some(resource_dir),
        ManagerConfig::default(),
        &context,
    )?;
    manager.start_kernel().await?;
    println!("\nStarted kernel.");

    while manager.is_alive().await {
        print!("> ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            break;
        }

        let Some(client) = manager.client() else {
            break;
        };
        let reply = client
            .execute_interactive(
                ExecuteRequest::new(input),
                print_output,
                Duration::from_secs(300),
            )
            .await;
        if let Err(err) = reply {
            eprintln!("{err}");
            if client.execution_state() == ExecutionState::Dead {
                break;
            }
        }
    }

    manager.shutdown_kernel(false).await?;
    Ok(())
}
