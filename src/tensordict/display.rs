use crate::tensordict::{Layout, TensorDict};
use crate::tensors::Device;
use crate::value::Value;

use std::fmt;

const INDENT: &str = "    ";

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                line.to_string()
            } else {
                format!("{}{}", INDENT, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn device_name(device: Option<Device>) -> String {
    match device {
        Some(device) => device.to_string(),
        None => "None".to_string(),
    }
}

fn entry(td: &TensorDict, key: &str) -> String {
    match td.get_local_opt(key) {
        Ok(Some(Value::Tensor(tensor))) => format!(
            "Tensor(shape={:?}, device={}, dtype={})",
            tensor.shape(),
            tensor.device(),
            tensor.dtype()
        ),
        Ok(Some(Value::Dict(nested))) => nested.to_string(),
        Ok(Some(Value::NonTensor(data))) => format!(
            "NonTensorData(data={:?}, batch_size={:?}, device={})",
            data.data(),
            data.batch_size(),
            device_name(data.device())
        ),
        Ok(Some(Value::NonTensorStack(stack))) => format!(
            "NonTensorStack(batch_size={:?}, device={})",
            stack.batch_size(),
            device_name(stack.device())
        ),
        // Entries of a lazy stack that differ in shape between members.
        _ => match td.get_item_shape(key) {
            Ok(shape) => format!("Tensor(shape={:?}, heterogeneous)", shape),
            Err(_) => "<unreadable>".to_string(),
        },
    }
}

/**
 * Prints every entry with its metadata, recursing into nested tensordicts, followed by the
 * batch size and device.
 *
 * ```
 * use easy_tensordict::TensorDict;
 * use easy_tensordict::tensors::Tensor;
 * let td = TensorDict::new([2]);
 * td.set("a", Tensor::zeros([2, 3])).unwrap();
 * assert_eq!(
 *     td.to_string(),
 *     "TensorDict(\n    fields={\n        a: Tensor(shape=[2, 3], device=cpu, dtype=float32)},\n    \
 *      batch_size=[2],\n    device=None,\n    is_shared=false)"
 * );
 * ```
 */
impl fmt::Display for TensorDict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fields: Vec<String> = self
            .keys()
            .iter()
            .map(|key| format!("{}: {}", key, entry(self, key)))
            .collect();
        let fields = if fields.is_empty() {
            String::new()
        } else {
            format!("\n{}", indent(&fields.join(",\n")))
        };
        let mut lines = vec![
            indent(&format!("fields={{{}}}", fields)),
            indent(&format!("batch_size={:?}", self.batch_size())),
            indent(&format!("device={}", device_name(self.device()))),
            indent(&format!("is_shared={}", self.is_shared())),
        ];
        match self.layout() {
            Layout::Stacked(stacked) => {
                lines.push(indent(&format!("stack_dim={}", stacked.stack_dim)));
            }
            Layout::View(view) => {
                lines.push(indent(&format!("op={:?}", view.op)));
            }
            Layout::Dense => {}
        }
        let name = match self.layout() {
            Layout::View(_) => "_ViewedTensorDict".to_string(),
            _ => self.kind().to_string(),
        };
        write!(f, "{}(\n{})", name, lines.join(",\n"))
    }
}

impl fmt::Debug for TensorDict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Tensor;

    #[test]
    fn nested_containers_are_indented() {
        let td = TensorDict::new([]);
        td.set(("b", "c"), 1.0).unwrap();
        td.set_non_tensor("text", "hi").unwrap();
        let printed = td.to_string();
        assert!(printed.contains("\n    fields={\n        b: TensorDict(\n            fields={"));
        assert!(printed.contains("text: NonTensorData(data="));
    }

    #[test]
    fn lazy_stacks_print_heterogeneous_shapes() {
        let a = TensorDict::new([]);
        a.set("x", Tensor::zeros([2])).unwrap();
        let b = TensorDict::new([]);
        b.set("x", Tensor::zeros([3])).unwrap();
        let stacked = TensorDict::lazy_stack(&[a, b], 0).unwrap();
        let printed = stacked.to_string();
        assert!(printed.starts_with("LazyStackedTensorDict("));
        assert!(printed.contains("x: Tensor(shape=[2, -1], heterogeneous)"));
        assert!(printed.contains("stack_dim=0"));
    }
}
