//! IRQ management with nesting-aware priority masking.
//!
//! Each of the 16 legacy lines has a priority (lower value = higher
//! priority, defaulting to the line number). On entry the previous PIC mask
//! and priority are pushed on a small nesting stack, every line of
//! equal-or-lower priority is masked, and interrupts are re-enabled so a
//! higher-priority line can nest. Exit restores the saved mask and only
//! re-enables interrupts while still nested (the outermost exit returns to
//! the trap epilogue with IF clear).

use spin::Mutex;

use super::interrupts::TrapFrame;
use super::pic;

/// Handler for one IRQ line.
pub type IrqHandler = fn(u8, &mut TrapFrame);

const IRQ_LINES: usize = 16;
const NEST_LIMIT: usize = 8;

struct IrqState {
    handlers: [Option<IrqHandler>; IRQ_LINES],
    names: [&'static str; IRQ_LINES],
    priorities: [u8; IRQ_LINES],
    mask_stack: [u16; NEST_LIMIT],
    prio_stack: [u8; NEST_LIMIT],
    nesting: usize,
    current_priority: u8,
    /// One bit per line: already logged as unhandled.
    unhandled_logged: u16,
}

impl IrqState {
    const fn new() -> Self {
        Self {
            handlers: [None; IRQ_LINES],
            names: ["unassigned"; IRQ_LINES],
            priorities: [0; IRQ_LINES],
            mask_stack: [0; NEST_LIMIT],
            prio_stack: [0; NEST_LIMIT],
            nesting: 0,
            current_priority: 0xFF,
            unhandled_logged: 0,
        }
    }
}

static IRQS: Mutex<IrqState> = Mutex::new(IrqState::new());

/// Mask covering every line whose priority is equal to or lower than `prio`
/// (higher numeric value = lower priority), merged into the previous mask.
fn blocking_mask(priorities: &[u8; IRQ_LINES], prio: u8, prev_mask: u16) -> u16 {
    let mut mask = prev_mask;
    for (line, &line_prio) in priorities.iter().enumerate() {
        if line_prio >= prio {
            mask |= 1 << line;
        }
    }
    mask
}

/// Reset priorities to the default (line number) and clear the nest stack.
pub fn init() {
    let mut irqs = IRQS.lock();
    for (line, prio) in irqs.priorities.iter_mut().enumerate() {
        *prio = line as u8;
    }
    irqs.nesting = 0;
    irqs.current_priority = 0xFF;
}

pub fn register_handler(line: u8, handler: IrqHandler, name: &'static str) {
    if (line as usize) < IRQ_LINES {
        let mut irqs = IRQS.lock();
        irqs.handlers[line as usize] = Some(handler);
        irqs.names[line as usize] = name;
    }
}

pub fn unregister_handler(line: u8) {
    if (line as usize) < IRQ_LINES {
        let mut irqs = IRQS.lock();
        irqs.handlers[line as usize] = None;
        irqs.names[line as usize] = "unassigned";
    }
}

pub fn set_priority(line: u8, priority: u8) {
    if (line as usize) < IRQ_LINES {
        IRQS.lock().priorities[line as usize] = priority;
    }
}

/// Enter an IRQ: push the PIC mask and priority, mask equal-or-lower
/// priority lines, and allow higher-priority nesting. If the nesting stack
/// is exhausted, interrupts stay masked for this handler.
pub fn enter(line: u8) {
    if line as usize >= IRQ_LINES {
        return;
    }
    {
        let mut irqs = IRQS.lock();
        if irqs.nesting >= NEST_LIMIT {
            log::warn!("IRQ nesting overflow, keeping interrupts masked");
            return;
        }

        let prev_mask = pic::get_mask();
        let prio = irqs.priorities[line as usize];
        let new_mask = blocking_mask(&irqs.priorities, prio, prev_mask);

        let depth = irqs.nesting;
        irqs.mask_stack[depth] = prev_mask;
        irqs.prio_stack[depth] = irqs.current_priority;
        irqs.nesting = depth + 1;
        irqs.current_priority = prio;

        pic::set_mask_all(new_mask);
    }
    x86_64::instructions::interrupts::enable();
}

/// Leave an IRQ: restore the saved mask and priority. Interrupts are left
/// disabled at the outermost level (the iretq re-enables them via RFLAGS).
pub fn exit() {
    x86_64::instructions::interrupts::disable();
    let still_nested = {
        let mut irqs = IRQS.lock();
        if irqs.nesting == 0 {
            return;
        }
        irqs.nesting -= 1;
        let depth = irqs.nesting;
        irqs.current_priority = irqs.prio_stack[depth];
        pic::set_mask_all(irqs.mask_stack[depth]);
        irqs.nesting > 0
    };
    if still_nested {
        x86_64::instructions::interrupts::enable();
    }
}

/// Invoke the registered handler for a line; log unhandled lines once.
pub fn dispatch(line: u8, frame: &mut TrapFrame) {
    if line as usize >= IRQ_LINES {
        return;
    }
    let handler = {
        let mut irqs = IRQS.lock();
        match irqs.handlers[line as usize] {
            Some(handler) => Some(handler),
            None => {
                if irqs.unhandled_logged & (1 << line) == 0 {
                    log::warn!("unhandled IRQ {line} ({})", irqs.names[line as usize]);
                    irqs.unhandled_logged |= 1 << line;
                }
                None
            }
        }
    };
    if let Some(handler) = handler {
        handler(line, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_priorities_mask_equal_and_lower() {
        let mut priorities = [0u8; IRQ_LINES];
        for (line, prio) in priorities.iter_mut().enumerate() {
            *prio = line as u8;
        }
        // Timer (line 0, priority 0) blocks everything.
        assert_eq!(blocking_mask(&priorities, 0, 0), 0xFFFF);
        // Keyboard (priority 1) leaves only the timer unmasked.
        assert_eq!(blocking_mask(&priorities, 1, 0), 0xFFFE);
        // Lowest priority blocks only itself.
        assert_eq!(blocking_mask(&priorities, 15, 0), 0x8000);
    }

    #[test]
    fn previous_mask_is_preserved() {
        let mut priorities = [0u8; IRQ_LINES];
        for (line, prio) in priorities.iter_mut().enumerate() {
            *prio = line as u8;
        }
        // A line that was already masked stays masked even if its priority
        // would leave it open.
        let mask = blocking_mask(&priorities, 8, 0b0000_0000_0000_0110);
        assert_eq!(mask & 0b110, 0b110);
        assert_eq!(mask & 0xFF00, 0xFF00);
    }

    #[test]
    fn shared_priority_blocks_peers() {
        let mut priorities = [5u8; IRQ_LINES];
        priorities[0] = 0;
        // At priority 5, every peer line is blocked but the timer stays open.
        let mask = blocking_mask(&priorities, 5, 0);
        assert_eq!(mask, 0xFFFE);
    }
}
