use std::fmt::Write;

use super::command::Command;
use super::wire::{CREATE_PORT_MARKER, WireMessage};

/// Multi-line dump of a message for debug logs.
pub fn describe(ctx: &str, msg: &WireMessage) -> String {
    let mut out = String::new();
    let command = msg.command;
    let status_code = msg.status.code;
    let status_flags = msg.status.flags;
    let param_flags = msg.parameter.flags;
    let (source, target) = (msg.parameter.link.source, msg.parameter.link.target);

    let _ = writeln!(out, "[{ctx}] {{");
    match msg.decode_context() {
        Ok(ctx) => {
            let _ = writeln!(out, "\t.context = {} ({ctx:?}),", msg.context);
        }
        Err(_) => {
            let _ = writeln!(out, "\t.context = {} (?),", msg.context);
        }
    }
    match Command::try_from(command) {
        Ok(cmd) => {
            let _ = writeln!(out, "\t.command = {command} ({cmd}),");
        }
        Err(_) => {
            let _ = writeln!(out, "\t.command = {command} (?),");
        }
    }
    let _ = writeln!(out, "\t.status.code = 0x{status_code:x},");
    let _ = writeln!(out, "\t.status.flags = 0x{status_flags:x},");
    let _ = writeln!(out, "\t.parameter.flags = 0x{param_flags:x},");

    if param_flags == CREATE_PORT_MARKER {
        match msg.port_parameters() {
            Ok(p) => {
                let _ = writeln!(out, "\t.line = {p},");
            }
            Err(e) => {
                let _ = writeln!(out, "\t.line = <{e}>,");
            }
        }
    } else {
        let _ = writeln!(out, "\t.link = {source} -> {target},");
        for p in msg.ports() {
            let _ = writeln!(out, "\t.port = {} {:?} flags=0x{:x},", p.id, p.name, p.flags);
        }
        for l in msg.links() {
            let _ = writeln!(out, "\t.link[{}] = {} <-> {},", l.slot, l.source, l.target);
        }
    }
    out.push('}');
    out
}
