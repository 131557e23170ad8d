//! Syntax tree walk that matches constructs against the denylist.

use std::collections::HashMap;

use tree_sitter::Node;

use super::patterns::PatternRegistry;
use crate::types::{Finding, SourceLocation};

pub(crate) const CODE_SYNTAX_ERROR: &str = "syntax-error";
pub(crate) const CODE_FORBIDDEN_MODULE: &str = "forbidden-module";
pub(crate) const CODE_FORBIDDEN_CALLABLE: &str = "forbidden-callable";
pub(crate) const CODE_FORBIDDEN_ATTRIBUTE: &str = "forbidden-attribute";
pub(crate) const CODE_FORBIDDEN_REFERENCE: &str = "forbidden-reference";

const REFLECTIVE_ACCESSORS: [&str; 3] = ["getattr", "setattr", "delattr"];
const DYNAMIC_IMPORTERS: [&str; 2] = ["__import__", "importlib.import_module"];

pub(super) fn location(node: Node<'_>) -> SourceLocation {
    let start = node.start_position();
    SourceLocation::from_zero_based(start.row, start.column)
}

/// First node that makes the tree invalid Python 3, in source order
pub(super) fn first_syntax_error(root: Node<'_>, src: &str) -> Option<Finding> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        let message = if node.is_missing() {
            Some(format!("syntax error: missing '{}'", node.kind()))
        } else if node.is_error() {
            let text = node.utf8_text(src.as_bytes()).unwrap_or("");
            Some(format!("syntax error: invalid syntax near '{}'", snippet(text)))
        } else if node.kind() == "exec_statement" {
            Some("syntax error: Python 2 exec statement".to_string())
        } else if node.kind() == "print_statement" && !is_parenthesized_print(node, src) {
            Some("syntax error: Python 2 print statement".to_string())
        } else {
            None
        };

        if let Some(message) = message {
            return Some(
                Finding::critical(message)
                    .at(location(node))
                    .with_code(CODE_SYNTAX_ERROR),
            );
        }

        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    None
}

/// `print ("x")` is valid in both dialects
fn is_parenthesized_print(node: Node<'_>, src: &str) -> bool {
    node.utf8_text(src.as_bytes())
        .ok()
        .and_then(|text| text.strip_prefix("print"))
        .is_some_and(|rest| rest.trim_start().starts_with('('))
}

fn snippet(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() > 40 {
        let cut: String = line.chars().take(40).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

/// Denylist matcher over one parsed module
pub(super) struct Walker<'a> {
    src: &'a str,
    patterns: &'a PatternRegistry,
    aliases: HashMap<String, String>,
    findings: Vec<Finding>,
}

impl<'a> Walker<'a> {
    pub(super) fn new(src: &'a str, patterns: &'a PatternRegistry) -> Self {
        Self {
            src,
            patterns,
            aliases: HashMap::new(),
            findings: Vec::new(),
        }
    }

    /// Walk the whole tree, depth first, and return the findings in source order
    pub(super) fn run(mut self, root: Node<'_>) -> Vec<Finding> {
        self.collect_aliases(root);

        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            self.visit(node);
            let mut cursor = node.walk();
            let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }

        self.findings.sort_by_key(|f| f.location);
        self.findings
    }

    fn text(&self, node: Node<'_>) -> &'a str {
        node.utf8_text(self.src.as_bytes()).unwrap_or("")
    }

    fn push(&mut self, finding: Finding, node: Node<'_>, code: &str) {
        self.findings.push(finding.at(location(node)).with_code(code));
    }

    /// Record `import a as b` and `from a import b [as c]` bindings
    fn collect_aliases(&mut self, root: Node<'_>) {
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            match node.kind() {
                "import_statement" => {
                    for name in field_children(node, "name") {
                        if name.kind() == "aliased_import" {
                            if let (Some(target), Some(alias)) = (
                                name.child_by_field_name("name"),
                                name.child_by_field_name("alias"),
                            ) {
                                let alias = self.text(alias).to_string();
                                let target = self.text(target).to_string();
                                self.aliases.insert(alias, target);
                            }
                        }
                    }
                }
                "import_from_statement" => {
                    let Some(module) = node.child_by_field_name("module_name") else {
                        continue;
                    };
                    if module.kind() == "relative_import" {
                        continue;
                    }
                    let module = self.text(module).to_string();
                    for name in field_children(node, "name") {
                        let (target, alias) = if name.kind() == "aliased_import" {
                            match (
                                name.child_by_field_name("name"),
                                name.child_by_field_name("alias"),
                            ) {
                                (Some(target), Some(alias)) => (target, alias),
                                _ => continue,
                            }
                        } else {
                            (name, name)
                        };
                        let alias = self.text(alias).to_string();
                        let target = format!("{module}.{}", self.text(target));
                        self.aliases.insert(alias, target);
                    }
                }
                _ => {
                    let mut cursor = node.walk();
                    stack.extend(node.named_children(&mut cursor));
                }
            }
        }
    }

    /// Rewrite the first segment of a dotted name through the import aliases
    fn resolve(&self, dotted: &str) -> String {
        let (head, rest) = match dotted.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (dotted, None),
        };
        match (self.aliases.get(head), rest) {
            (Some(target), Some(rest)) => format!("{target}.{rest}"),
            (Some(target), None) => target.clone(),
            (None, _) => dotted.to_string(),
        }
    }

    fn dotted_name(&self, node: Node<'_>) -> Option<String> {
        match node.kind() {
            "identifier" => Some(self.text(node).to_string()),
            "attribute" => {
                let object = self.dotted_name(node.child_by_field_name("object")?)?;
                let attribute = self.text(node.child_by_field_name("attribute")?);
                Some(format!("{object}.{attribute}"))
            }
            _ => None,
        }
    }

    fn visit(&mut self, node: Node<'_>) {
        match node.kind() {
            "import_statement" => self.check_import(node),
            "import_from_statement" => self.check_from_import(node),
            "call" => self.check_call(node),
            "attribute" => self.check_attribute(node),
            "identifier" => self.check_identifier(node),
            _ => {}
        }
    }

    fn check_import(&mut self, node: Node<'_>) {
        for name in field_children(node, "name") {
            let module = if name.kind() == "aliased_import" {
                match name.child_by_field_name("name") {
                    Some(module) => module,
                    None => continue,
                }
            } else {
                name
            };
            let module_name = self.text(module);
            if self.patterns.is_forbidden_module(module_name) {
                self.push(
                    Finding::error(format!("import of forbidden module '{module_name}'")),
                    module,
                    CODE_FORBIDDEN_MODULE,
                );
            }
        }
    }

    fn check_from_import(&mut self, node: Node<'_>) {
        let Some(module) = node.child_by_field_name("module_name") else {
            return;
        };
        if module.kind() == "relative_import" {
            return;
        }
        let module_name = self.text(module);
        if self.patterns.is_forbidden_module(module_name) {
            self.push(
                Finding::error(format!("import from forbidden module '{module_name}'")),
                module,
                CODE_FORBIDDEN_MODULE,
            );
            return;
        }

        for name in field_children(node, "name") {
            let target = if name.kind() == "aliased_import" {
                match name.child_by_field_name("name") {
                    Some(target) => target,
                    None => continue,
                }
            } else {
                name
            };
            let qualified = format!("{module_name}.{}", self.text(target));
            if self.patterns.is_forbidden_callable(&qualified) {
                self.push(
                    Finding::error(format!("import of forbidden callable '{qualified}'")),
                    target,
                    CODE_FORBIDDEN_CALLABLE,
                );
            }
        }
    }

    fn check_call(&mut self, node: Node<'_>) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let Some(raw) = self.dotted_name(function) else {
            return;
        };
        let resolved = self.resolve(&raw);

        let matched = if self.patterns.is_forbidden_callable(&resolved) {
            Some(resolved.clone())
        } else if self.patterns.is_forbidden_callable(&raw) {
            Some(raw.clone())
        } else {
            None
        };
        if let Some(name) = matched {
            self.push(
                Finding::error(format!("call to forbidden callable '{name}'")),
                function,
                CODE_FORBIDDEN_CALLABLE,
            );
        }

        let Some(arguments) = node.child_by_field_name("arguments") else {
            return;
        };
        let positional: Vec<Node<'_>> = {
            let mut cursor = arguments.walk();
            arguments
                .named_children(&mut cursor)
                .filter(|arg| !matches!(arg.kind(), "keyword_argument" | "comment"))
                .collect()
        };

        let is_one_of = |names: &[&str]| {
            names
                .iter()
                .any(|name| *name == resolved.as_str() || *name == raw.as_str())
        };

        if is_one_of(&REFLECTIVE_ACCESSORS) {
            if let Some(attr) = positional.get(1).and_then(|arg| self.string_literal(*arg)) {
                if self.patterns.is_forbidden_attribute(&attr) {
                    self.push(
                        Finding::critical(format!(
                            "reflective access to forbidden attribute '{attr}'"
                        )),
                        positional[1],
                        CODE_FORBIDDEN_ATTRIBUTE,
                    );
                }
            }
        }

        if is_one_of(&DYNAMIC_IMPORTERS) {
            if let Some(module) = positional.first().and_then(|arg| self.string_literal(*arg)) {
                if self.patterns.is_forbidden_module(&module) {
                    self.push(
                        Finding::error(format!("dynamic import of forbidden module '{module}'")),
                        positional[0],
                        CODE_FORBIDDEN_MODULE,
                    );
                }
            }
        }
    }

    fn check_attribute(&mut self, node: Node<'_>) {
        let Some(attribute) = node.child_by_field_name("attribute") else {
            return;
        };
        let name = self.text(attribute);
        if self.patterns.is_forbidden_attribute(name) {
            self.push(
                Finding::critical(format!("access to forbidden attribute '{name}'")),
                attribute,
                CODE_FORBIDDEN_ATTRIBUTE,
            );
        }
    }

    fn check_identifier(&mut self, node: Node<'_>) {
        let Some(parent) = node.parent() else {
            return;
        };
        let is_field = |field: &str| {
            parent
                .child_by_field_name(field)
                .is_some_and(|child| child.id() == node.id())
        };

        match parent.kind() {
            "attribute" if is_field("attribute") => return,
            "dotted_name" | "aliased_import" | "import_statement" | "import_from_statement" => {
                return
            }
            _ => {}
        }

        let name = self.text(node);
        if self.patterns.is_forbidden_attribute(name) {
            self.push(
                Finding::critical(format!("reference to forbidden name '{name}'")),
                node,
                CODE_FORBIDDEN_ATTRIBUTE,
            );
            return;
        }

        if name.contains('.') || !self.patterns.is_forbidden_callable(name) {
            return;
        }
        if parent.kind() == "call" && is_field("function") {
            return;
        }
        if is_binding_site(node, parent) || self.is_function_local(node, name) {
            return;
        }
        self.push(
            Finding::error(format!("reference to forbidden callable '{name}'")),
            node,
            CODE_FORBIDDEN_REFERENCE,
        );
    }

    /// Whether `name` read at `node` resolves to a local of some enclosing
    /// function rather than to the builtin.
    ///
    /// Module and class bindings never count: `eval = eval` at module level
    /// still reads the builtin on its right-hand side.
    fn is_function_local(&self, node: Node<'_>, name: &str) -> bool {
        let mut scope = enclosing_function(node);
        while let Some(function) = scope {
            match self.binding_in(function, name) {
                Binding::Local => return true,
                Binding::Global => return false,
                Binding::Nonlocal | Binding::Free => scope = enclosing_function(function),
            }
        }
        false
    }

    /// How `function` binds `name` in its own scope
    fn binding_in(&self, function: Node<'_>, name: &str) -> Binding {
        let mut stack: Vec<Node<'_>> = ["parameters", "body"]
            .into_iter()
            .filter_map(|field| function.child_by_field_name(field))
            .collect();
        let mut binding = Binding::Free;
        while let Some(node) = stack.pop() {
            match node.kind() {
                "identifier" => {
                    let Some(parent) = node.parent() else {
                        continue;
                    };
                    if self.text(node) != name {
                        continue;
                    }
                    match parent.kind() {
                        "global_statement" => return Binding::Global,
                        "nonlocal_statement" => binding = Binding::Nonlocal,
                        "keyword_argument" => {}
                        _ if binding == Binding::Free && is_binding_site(node, parent) => {
                            binding = Binding::Local;
                        }
                        _ => {}
                    }
                }
                // nested scopes only bind their own name here
                "function_definition" | "class_definition" => {
                    if binding == Binding::Free
                        && node
                            .child_by_field_name("name")
                            .is_some_and(|n| self.text(n) == name)
                    {
                        binding = Binding::Local;
                    }
                }
                "lambda" => {}
                _ => {
                    let mut cursor = node.walk();
                    stack.extend(node.named_children(&mut cursor));
                }
            }
        }
        binding
    }

    /// Value of a plain string literal; `None` for f-strings and non-strings
    fn string_literal(&self, node: Node<'_>) -> Option<String> {
        if node.kind() != "string" {
            return None;
        }
        let mut cursor = node.walk();
        let mut value = String::new();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "string_content" => value.push_str(self.text(child)),
                "string_start" | "string_end" => {}
                _ => return None,
            }
        }
        Some(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Binding {
    Local,
    Global,
    Nonlocal,
    Free,
}

/// Innermost function or lambda whose body contains `node`.
///
/// Parameter defaults, annotations and decorators belong to the outer scope.
fn enclosing_function(node: Node<'_>) -> Option<Node<'_>> {
    let mut child = node;
    while let Some(parent) = child.parent() {
        if matches!(parent.kind(), "function_definition" | "lambda")
            && parent
                .child_by_field_name("body")
                .is_some_and(|body| body.id() == child.id())
        {
            return Some(parent);
        }
        child = parent;
    }
    None
}

fn field_children<'t>(node: Node<'t>, field: &str) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children_by_field_name(field, &mut cursor).collect()
}

/// Identifiers that bind a name rather than read it
fn is_binding_site(node: Node<'_>, parent: Node<'_>) -> bool {
    let is_field = |field: &str| {
        parent
            .child_by_field_name(field)
            .is_some_and(|child| child.id() == node.id())
    };
    match parent.kind() {
        "function_definition" | "class_definition" | "keyword_argument" | "default_parameter"
        | "typed_default_parameter" => is_field("name"),
        "assignment" | "for_statement" | "for_in_clause" => is_field("left"),
        "parameters" | "lambda_parameters" | "typed_parameter" | "list_splat_pattern"
        | "dictionary_splat_pattern" | "global_statement" | "nonlocal_statement" => true,
        _ => false,
    }
}
