//! Static argument injection.
//!
//! Inbound static args are prefixed to the arguments of every call this peer
//! serves. Outbound static args are appended to the result values of every
//! plain call this peer makes, after the remote result arrives. Neither list is
//! ever advertised in the registry frame.

use crate::protocol::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticArgs {
    inbound: Vec<Value>,
    outbound: Vec<Value>,
}

impl StaticArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_in(&mut self, values: Vec<Value>) {
        self.inbound = values;
    }

    pub fn set_out(&mut self, values: Vec<Value>) {
        self.outbound = values;
    }

    pub fn inbound(&self) -> &[Value] {
        &self.inbound
    }

    pub fn outbound(&self) -> &[Value] {
        &self.outbound
    }

    /// Prefix the configured values to caller-supplied arguments.
    pub fn apply_in(&self, args: Vec<Value>) -> Vec<Value> {
        if self.inbound.is_empty() {
            return args;
        }
        let mut out = Vec::with_capacity(self.inbound.len() + args.len());
        out.extend(self.inbound.iter().cloned());
        out.extend(args);
        out
    }

    /// Append the configured values after the real result values.
    pub fn apply_out(&self, mut values: Vec<Value>) -> Vec<Value> {
        values.extend(self.outbound.iter().cloned());
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_args_are_prefixed_in_order() {
        let mut s = StaticArgs::new();
        s.set_in(vec!["foo".into(), "bar".into()]);
        let args = s.apply_in(vec!["baz".into()]);
        assert_eq!(args, vec![Value::from("foo"), "bar".into(), "baz".into()]);
    }

    #[test]
    fn out_args_are_appended_after_result() {
        let mut s = StaticArgs::new();
        s.set_out(vec![Value::Int(1), Value::Int(2)]);
        let values = s.apply_out(vec![Value::from("result")]);
        assert_eq!(values, vec![Value::from("result"), Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn empty_lists_are_identity() {
        let s = StaticArgs::new();
        let args = vec![Value::Null, Value::Bool(false)];
        assert_eq!(s.apply_in(args.clone()), args);
        assert_eq!(s.apply_out(args.clone()), args);
    }

    #[test]
    fn setting_replaces_previous_values() {
        let mut s = StaticArgs::new();
        s.set_in(vec![Value::Int(1)]);
        s.set_in(vec![Value::Int(2)]);
        assert_eq!(s.inbound(), &[Value::Int(2)]);
    }
}
