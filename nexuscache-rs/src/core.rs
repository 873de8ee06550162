//! Provides a bunch of diagnostic commands.
//!
//! Provides the following commands:
//! * **SYS.COMMANDS**: Lists all known commands, their number of calls and their average
//!   duration.
//! * **SYS.CONNECTIONS**: Lists all currently connected clients (this includes peers, as
//!   the peer RPC travels over ordinary connections).
//! * **SYS.KILL**: Terminates the connection to the given client (selected by its peer
//!   address).
//! * **SYS.SET_CONFIG**: Replaces the system configuration with the given YAML.
//!
//! [install](install) is invoked by the [Builder](crate::builder::Builder) unless disabled.
use crate::commands::{queue, Call, CommandDictionary, CommandError, CommandResult};
use crate::config::Config;
use crate::fmt::format_short_duration;
use crate::platform::Platform;
use crate::server::Server;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use anyhow::Context;
use std::borrow::Cow;
use std::sync::Arc;

/// Enumerates the commands supported by this facility.
#[derive(FromPrimitive)]
enum Commands {
    Commands,
    Connections,
    Kill,
    SetConfig,
}

/// Installs the diagnostic commands into the given platform.
///
/// This is invoked by the [Builder](crate::builder::Builder) unless disabled.
pub fn install(platform: Arc<Platform>) {
    if let Some(commands) = platform.find::<CommandDictionary>() {
        let queue = actor(platform.clone());
        commands.register_command("SYS.COMMANDS", queue.clone(), Commands::Commands as usize);
        commands.register_command(
            "SYS.CONNECTIONS",
            queue.clone(),
            Commands::Connections as usize,
        );
        commands.register_command("SYS.KILL", queue.clone(), Commands::Kill as usize);
        commands.register_command("SYS.SET_CONFIG", queue, Commands::SetConfig as usize);
    }
}

/// Receives incoming calls for the commands defined above.
fn actor(platform: Arc<Platform>) -> crate::commands::Queue {
    use crate::commands::ResultExt;

    let (queue, mut endpoint) = queue();

    let _ = tokio::spawn(async move {
        let server = platform.require::<Server>();
        let config = platform.require::<Config>();
        let commands = platform.require::<CommandDictionary>();

        loop {
            match endpoint.recv().await {
                Some(mut call) => match Commands::from_usize(call.token) {
                    Some(Commands::Commands) => {
                        commands_command(&mut call, &commands).complete(call)
                    }
                    Some(Commands::Connections) => {
                        connections_command(&mut call, &server).complete(call)
                    }
                    Some(Commands::Kill) => kill_command(&mut call, &server).complete(call),
                    Some(Commands::SetConfig) => {
                        set_config_command(&mut call, &config).await.complete(call)
                    }
                    _ => call.handle_unknown_token(),
                },
                _ => return,
            }
        }
    });

    queue
}

fn connections_command(call: &mut Call, server: &Arc<Server>) -> CommandResult {
    let connections = server.connections();
    let mut result = String::new();

    result += format!("Open connections: {}\n\n", connections.len()).as_str();
    result += format!(
        "{:<20} {:<30} {:>10} {:>15}\n",
        "Remote Address", "Client Name", "Calls", "Avg. Duration"
    )
    .as_str();
    result += crate::response::SEPARATOR;

    for connection in connections {
        result += format!(
            "{:<20} {:<30} {:>10} {:>15}\n",
            &connection.peer_address,
            if connection.client.is_empty() {
                Cow::Borrowed("")
            } else {
                Cow::Owned(connection.client.clone())
            },
            connection.commands.count(),
            format_short_duration(connection.commands.avg())
        )
        .as_str();
    }
    result += crate::response::SEPARATOR;

    call.response.bulk(result)?;

    Ok(())
}

fn kill_command(call: &mut Call, server: &Arc<Server>) -> CommandResult {
    if server.kill(call.request.str_parameter(0)?) {
        call.response.ok()?;
        Ok(())
    } else {
        Err(CommandError::ServerError(anyhow::anyhow!("Unknown peer!")))
    }
}

async fn set_config_command(call: &mut Call, config: &Arc<Config>) -> CommandResult {
    let new_config = call
        .request
        .str_parameter(0)
        .context("Expected a valid YAML config as parameter.")?;
    config.store(new_config).await?;

    call.response.ok()?;
    Ok(())
}

fn commands_command(call: &mut Call, commands: &Arc<CommandDictionary>) -> CommandResult {
    let command_list = commands.commands();
    let mut result = String::new();

    result += format!("{:<30} {:>10} {:>20}\n", "Name", "Calls", "Duration").as_str();
    result += crate::response::SEPARATOR;

    for cmd in command_list {
        result += format!(
            "{:<30} {:>10} {:>20}\n",
            &cmd.name,
            cmd.call_count(),
            format_short_duration(cmd.avg_duration())
        )
        .as_str();
    }
    result += crate::response::SEPARATOR;

    call.response.bulk(result)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::commands::CommandDictionary;
    use crate::request::Request;
    use crate::testing::test_async;

    /// Being diagnostic commands, we do not test the actual table contents, but at least
    /// ensure a positive response shape.
    #[test]
    fn diagnostics_respond() {
        test_async(async {
            let platform = Builder::new()
                .enable_server()
                .enable_config()
                .enable_commands()
                .enable_core_commands()
                .build()
                .await;

            let mut dispatcher = platform.require::<CommandDictionary>().dispatcher();

            let result = dispatcher
                .invoke(Request::example(vec!["SYS.COMMANDS"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[0..1]).unwrap(), "$");

            let result = dispatcher
                .invoke(Request::example(vec!["SYS.CONNECTIONS"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[0..1]).unwrap(), "$");

            // KILL for an unknown peer address yields a server error...
            let result = dispatcher
                .invoke(Request::example(vec!["SYS.KILL", "nowhere:1"]), None)
                .await
                .unwrap();
            assert_eq!(std::str::from_utf8(&result[0..1]).unwrap(), "-");

            platform.terminate();
        });
    }
}
