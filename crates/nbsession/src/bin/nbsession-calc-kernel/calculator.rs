//! A calculator runtime: cells are `name = a + b + ...` over integer
//! literals, and the idle cell's output is the sum.
//!
//! A few cell bodies stand in for misbehaving user code:
//!
//! - `wait()` runs until interrupted (or 30 seconds pass),
//! - `hang()` never returns and ignores interrupts,
//! - `crash()` panics the kernel thread.
//!
//! UI-element updates are echoed back as variable values.

use std::time::{Duration, Instant};

use nbsession::commands::{Command, ExecuteCells, UpdateUiElement};
use nbsession::kernel::runtime::{KernelContext, KernelRuntime, RuntimeFactory};
use nbsession::kernel::KernelLaunchInfo;
use nbsession::notifications::{CellNotification, CellOutput, CellStatus, Notification, VariableValue};
use serde_json::json;

const MAX_WAIT: Duration = Duration::from_secs(30);

pub struct Calculator;

fn evaluate(code: &str) -> Option<i64> {
    let (_, expression) = code.split_once('=')?;
    expression
        .split('+')
        .map(|term| term.trim().parse::<i64>().ok())
        .sum()
}

fn cell_op(cell_id: &str, status: CellStatus) -> CellNotification {
    CellNotification::new(cell_id.to_string()).with_status(status)
}

/// Poll for an interrupt. Returns true if one arrived.
fn wait_for_interrupt(ctx: &mut KernelContext) -> bool {
    let started = Instant::now();
    while started.elapsed() < MAX_WAIT {
        if ctx.check_interrupt() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

impl Calculator {
    fn run(&self, cells: &ExecuteCells, ctx: &mut KernelContext) {
        for (cell_id, _) in cells.iter() {
            ctx.emit(Notification::CellOp(cell_op(cell_id, CellStatus::Queued)));
        }
        for (cell_id, code) in cells.iter() {
            ctx.set_current_cell(Some(cell_id.clone()));
            ctx.emit(Notification::CellOp(
                cell_op(cell_id, CellStatus::Running).with_console(Vec::new()),
            ));

            let value = match code.trim() {
                "crash()" => panic!("kernel crashed on request"),
                "hang()" => loop {
                    std::thread::sleep(Duration::from_secs(1));
                },
                "wait()" => {
                    if wait_for_interrupt(ctx) {
                        ctx.emit(Notification::Interrupted);
                        ctx.emit(Notification::CellOp(cell_op(cell_id, CellStatus::Idle)));
                        ctx.set_current_cell(None);
                        return;
                    }
                    String::new()
                }
                code => evaluate(code).map(|v| v.to_string()).unwrap_or_default(),
            };

            ctx.emit(Notification::CellOp(
                cell_op(cell_id, CellStatus::Idle)
                    .with_output(CellOutput::new("output", "text/plain", json!(value))),
            ));
            ctx.set_current_cell(None);
        }
        ctx.emit(Notification::CompletedRun);
    }

    fn echo_ui_values(&self, update: &UpdateUiElement, ctx: &mut KernelContext) {
        let variables = update
            .iter()
            .map(|(object_id, value)| VariableValue {
                name: object_id.clone(),
                value: Some(value.to_string()),
                datatype: None,
            })
            .collect();
        ctx.emit(Notification::VariableValues { variables });
    }
}

impl KernelRuntime for Calculator {
    fn handle_command(&mut self, command: Command, ctx: &mut KernelContext) -> anyhow::Result<()> {
        match command {
            Command::ExecuteCells(cells) => self.run(&cells, ctx),
            Command::CreateNotebook(create) if create.auto_run => self.run(&create.execution, ctx),
            Command::SyncGraph { cells, run_ids, .. } => {
                let codes = run_ids
                    .iter()
                    .map(|cell_id| cells.get(cell_id).cloned().unwrap_or_default())
                    .collect();
                self.run(&ExecuteCells::new(run_ids, codes)?, ctx);
            }
            Command::UpdateUiElement(update) => self.echo_ui_values(&update, ctx),
            _ => {}
        }
        Ok(())
    }
}

pub struct CalculatorFactory;

impl RuntimeFactory for CalculatorFactory {
    fn create(&self, _launch: &KernelLaunchInfo) -> anyhow::Result<Box<dyn KernelRuntime>> {
        Ok(Box::new(Calculator))
    }
}
