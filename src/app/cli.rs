use std::{
    io::{self, Write},
    time::Duration,
};

use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal,
};

use task_chain_console::{
    ChainEvent, ChainStatus, ChainSummary, ControlError, TaskChainId, TaskManager,
};

const WATCH_POLL: Duration = Duration::from_millis(100);

const HELP: &[&str] = &[
    "run <command>              start a command as a new task",
    "run <name> -- <command>    start a named task",
    "list                       list all tasks",
    "show <id>                  make a task the active one",
    "status                     show the active task",
    "logs                       print the active task's log",
    "copy                       print the active task's log as plain text",
    "watch                      follow the active task's log (q/Esc to stop)",
    "end                        terminate the active task",
    "open | close               open or close the log view",
    "exit                       quit",
];

enum Flow {
    Continue,
    Exit,
}

pub fn run_cli(manager: TaskManager) -> io::Result<()> {
    println!("Task console started. Enter a command, 'help' or 'exit' to quit.");
    terminal::enable_raw_mode()?;
    let result = command_loop(&manager);
    terminal::disable_raw_mode()?;
    result
}

fn command_loop(manager: &TaskManager) -> io::Result<()> {
    let mut history: Vec<String> = Vec::new();
    loop {
        let input = read_line(&history)?;
        println!();
        if input.trim().is_empty() {
            continue;
        }
        history.push(input.clone());
        if let Flow::Exit = dispatch(manager, input.trim())? {
            return Ok(());
        }
    }
}

fn read_line(history: &[String]) -> io::Result<String> {
    let mut history_index = history.len();
    let mut input = String::new();
    redraw(&input)?;
    loop {
        let Event::Key(key_event) = event::read()? else {
            continue;
        };
        if key_event.kind != KeyEventKind::Press {
            continue;
        }
        match key_event.code {
            KeyCode::Enter => return Ok(input),
            KeyCode::Char('c') if key_event.modifiers.contains(KeyModifiers::CONTROL) => {
                return Ok("exit".to_string());
            }
            KeyCode::Up => {
                history_index = history_index.saturating_sub(1);
                if let Some(command) = history.get(history_index) {
                    input = command.clone();
                    redraw(&input)?;
                }
            }
            KeyCode::Down => {
                if history_index < history.len() {
                    history_index += 1;
                }
                input = history.get(history_index).cloned().unwrap_or_default();
                redraw(&input)?;
            }
            KeyCode::Char(c) => {
                input.push(c);
                print!("{}", c);
                io::stdout().flush()?;
            }
            KeyCode::Backspace => {
                input.pop();
                redraw(&input)?;
            }
            _ => {}
        }
    }
}

fn dispatch(manager: &TaskManager, input: &str) -> io::Result<Flow> {
    let (command, rest) = match input.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (input, ""),
    };
    let control = manager.control();

    match command {
        "run" => {
            if rest.is_empty() {
                say("Command to execute must be specified.");
                return Ok(Flow::Continue);
            }
            let (name, command) = match rest.split_once(" -- ") {
                Some((name, command)) => (name.trim(), command.trim()),
                None => (rest, rest),
            };
            match manager.launch(name, command) {
                Ok(id) => {
                    say(&format!("Started task {}.", id));
                    say("Use `watch` to follow its output.");
                }
                Err(e) => say(&format!("Failed to start task: {}", e)),
            }
        }
        "list" => print_list(&manager.list_chains(), manager.store().active_id()),
        "show" => match rest.parse::<TaskChainId>() {
            Ok(id) => match manager.store().set_active(id) {
                Ok(()) => say(&format!("Task {} is now active.", id)),
                Err(e) => say(&format!("{}.", capitalize(&e.to_string()))),
            },
            Err(_) => say("Invalid task ID format."),
        },
        "status" => match control.active_summary() {
            Some(summary) => print_summary(&summary),
            None => say("No active task."),
        },
        "logs" | "open" => {
            if command == "open" {
                control.open_view();
            }
            match control.active_summary() {
                Some(summary) => {
                    print_summary(&summary);
                    for line in control.get_visible_lines() {
                        say(&line);
                    }
                }
                None => say("No active task."),
            }
        }
        "copy" => {
            let text = control.copy_as_text();
            if text.is_empty() {
                say("Nothing to copy.");
            } else {
                say(&text.replace('\n', "\r\n"));
            }
        }
        "watch" => watch(manager)?,
        "end" => match control.request_termination() {
            Ok(key) => say(&format!("Sent termination request to process {}.", key)),
            Err(ControlError::NoActiveChain) => say("No active task to end."),
            Err(e) => say(&format!("Task was not terminated: {}", e)),
        },
        "close" => control.close_view(),
        "help" => HELP.iter().for_each(|line| say(line)),
        "exit" => {
            say("Exiting the program...");
            return Ok(Flow::Exit);
        }
        other => say(&format!("Unknown command: {}. Please try again.", other)),
    }
    Ok(Flow::Continue)
}

/// Prints the active chain's log and follows it until `q` or Esc.
fn watch(manager: &TaskManager) -> io::Result<()> {
    let control = manager.control();
    // Subscribed before the first read so no line falls in between.
    let events = control.subscribe();
    let Some(summary) = control.active_summary() else {
        say("No active task.");
        return Ok(());
    };
    control.open_view();
    print_summary(&summary);

    let id = summary.id;
    let mut shown = 0;
    print_new_lines(manager, id, &mut shown);
    loop {
        if event::poll(WATCH_POLL)? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
        let batch = WatchBatch::collect(events.try_iter(), id);
        if batch.appended {
            print_new_lines(manager, id, &mut shown);
        }
        for status in batch.statuses {
            say(&format!("Task {} is now {}.", id, status));
        }
    }
    control.close_view();
    Ok(())
}

/// What one poll of the event queue means for a watched chain. Any number
/// of appends collapses into a single reprint.
#[derive(Debug, Default, PartialEq)]
struct WatchBatch {
    appended: bool,
    statuses: Vec<ChainStatus>,
}

impl WatchBatch {
    fn collect(events: impl Iterator<Item = ChainEvent>, id: TaskChainId) -> Self {
        let mut batch = WatchBatch::default();
        for event in events {
            match event {
                ChainEvent::Appended(chain, _) if chain == id => batch.appended = true,
                ChainEvent::StatusChanged(chain, status) if chain == id => {
                    batch.statuses.push(status)
                }
                _ => {}
            }
        }
        batch
    }
}

fn print_new_lines(manager: &TaskManager, id: TaskChainId, shown: &mut usize) {
    if let Ok(lines) = manager.store().lines(id) {
        for line in lines.iter().skip(*shown) {
            say(line);
        }
        *shown = lines.len();
    }
}

fn print_summary(summary: &ChainSummary) {
    say(&format!(
        "Task Name: {}   Task ID: {}   Started: {}   Status: {}",
        summary.name,
        summary.id,
        summary.created_at.format("%Y-%m-%d %H:%M:%S"),
        summary.status
    ));
}

fn print_list(chains: &[ChainSummary], active: Option<TaskChainId>) {
    if chains.is_empty() {
        say("No tasks.");
        return;
    }
    say("\tTask list:");
    say(&format!("  {:<15} {:<10} {:<8} {:<8} {}", "ID", "Status", "PID", "Lines", "Name"));
    say(&"-".repeat(60));
    for chain in chains {
        let marker = if Some(chain.id) == active { '*' } else { ' ' };
        let process = chain
            .process_key
            .as_ref()
            .map(|key| key.to_string())
            .unwrap_or_else(|| "NONE".to_string());
        say(&format!(
            "{} {:<15} {:<10} {:<8} {:<8} {}",
            marker, chain.id, chain.status, process, chain.line_count, chain.name
        ));
    }
}

fn say(text: &str) {
    println!("\r{}\r", text);
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn redraw(input: &str) -> io::Result<()> {
    execute!(
        io::stdout(),
        cursor::MoveToColumn(0),
        terminal::Clear(terminal::ClearType::CurrentLine)
    )?;
    print!(">>> {}", input);
    io::stdout().flush()
}

#[cfg(test)]
mod tests {
    use task_chain_console::TaskChainStore;

    use super::*;

    #[test]
    fn many_appends_collapse_into_one_reprint() {
        let store = TaskChainStore::new();
        let events = store.subscribe();
        let watched = store.create_chain("train-1");
        let other = store.create_chain("download");
        for n in 0..50 {
            store.append(watched, format!("step {n}")).unwrap();
            store.append(other, "noise").unwrap();
        }
        store.mark_unknown(other).unwrap();

        let batch = WatchBatch::collect(events.try_iter(), watched);
        assert_eq!(
            batch,
            WatchBatch {
                appended: true,
                statuses: vec![],
            }
        );
    }

    #[test]
    fn status_changes_of_the_watched_chain_are_kept() {
        let store = TaskChainStore::new();
        let events = store.subscribe();
        let id = store.create_chain("train-1");
        store.mark_unknown(id).unwrap();

        let batch = WatchBatch::collect(events.try_iter(), id);
        assert!(!batch.appended);
        assert_eq!(batch.statuses, vec![ChainStatus::Unknown]);
    }
}
