//! Optional Lua 5.4 runtime for the `lua` built-in, via the `mlua` crate.
//!
//! Enabled with the `lua` Cargo feature:
//! ```text
//! cargo build --features lua
//! cargo test  --features lua
//! ```
//!
//! # Lua API
//!
//! Every chunk sees a snapshot of the template variables visible at the
//! call, and these globals:
//!
//! | Lua function             | Effect                                        |
//! |--------------------------|-----------------------------------------------|
//! | `nsm_get(name)`          | Variable text (a number when numeric) or nil  |
//! | `nsm_set(name, value)`   | Write a variable once the chunk finishes      |
//! | `nsm_print(values…)`     | Append to the call's result text              |
//! | `nsm_sys(cmd)`           | Run `sh -c cmd`, returning its stdout         |

use std::sync::OnceLock;

use regex::Regex;

#[cfg(feature = "lua")]
pub use lua_impl::LuaEngine;

/// Line number (within the chunk) named by a Lua error message.
pub fn error_line(msg: &str) -> Option<usize> {
    static LINE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = LINE.get_or_init(|| Regex::new(r":(\d+):").ok()).as_ref()?;
    re.captures(msg)?.get(1)?.as_str().parse().ok()
}

#[cfg(feature = "lua")]
mod lua_impl {
    use std::collections::HashMap;
    use std::process::Command;
    use std::sync::{Arc, Mutex, PoisonError};

    use mlua::prelude::*;

    // ── LuaBridge ─────────────────────────────────────────────────────────

    /// State shared between the engine and its registered functions for the
    /// duration of one chunk.
    #[derive(Debug, Default)]
    struct LuaBridge {
        vars: HashMap<String, String>,
        writes: Vec<(String, String)>,
        output: String,
    }

    fn text_of(value: &LuaValue) -> LuaResult<String> {
        Ok(match value {
            LuaValue::Nil => String::new(),
            LuaValue::Boolean(b) => if *b { "1" } else { "0" }.to_owned(),
            LuaValue::Integer(i) => i.to_string(),
            LuaValue::Number(f) => f.to_string(),
            LuaValue::String(s) => (*s.to_str()?).to_owned(),
            other => {
                return Err(LuaError::RuntimeError(format!(
                    "cannot convert a {} to text",
                    other.type_name()
                )))
            }
        })
    }

    // ── LuaEngine ─────────────────────────────────────────────────────────

    /// A Lua interpreter kept for the whole build, so globals defined by one
    /// chunk are visible to the next.
    pub struct LuaEngine {
        lua: Lua,
        bridge: Arc<Mutex<LuaBridge>>,
    }

    impl LuaEngine {
        pub fn new() -> LuaResult<Self> {
            let lua = Lua::new();
            let bridge = Arc::new(Mutex::new(LuaBridge::default()));
            Self::register_api(&lua, &bridge)?;
            Ok(Self { lua, bridge })
        }

        fn register_api(lua: &Lua, bridge: &Arc<Mutex<LuaBridge>>) -> LuaResult<()> {
            let globals = lua.globals();

            // nsm_get(name) → number | string | nil
            {
                let bridge = Arc::clone(bridge);
                globals.set(
                    "nsm_get",
                    lua.create_function(move |lua, name: String| {
                        let b = bridge.lock().unwrap_or_else(PoisonError::into_inner);
                        Ok(match b.vars.get(&name) {
                            None => LuaValue::Nil,
                            Some(text) => match text.trim().parse::<f64>() {
                                Ok(x) => LuaValue::Number(x),
                                Err(_) => LuaValue::String(lua.create_string(text)?),
                            },
                        })
                    })?,
                )?;
            }

            // nsm_set(name, value)
            {
                let bridge = Arc::clone(bridge);
                globals.set(
                    "nsm_set",
                    lua.create_function(move |_, (name, value): (String, LuaValue)| {
                        if name.is_empty() {
                            return Err(LuaError::RuntimeError(
                                "bad argument #1 to 'nsm_set' (name must not be empty)".into(),
                            ));
                        }
                        let text = text_of(&value)?;
                        let mut b = bridge.lock().unwrap_or_else(PoisonError::into_inner);
                        b.vars.insert(name.clone(), text.clone());
                        b.writes.push((name, text));
                        Ok(())
                    })?,
                )?;
            }

            // nsm_print(values…)
            {
                let bridge = Arc::clone(bridge);
                globals.set(
                    "nsm_print",
                    lua.create_function(move |_, values: LuaMultiValue| {
                        let mut b = bridge.lock().unwrap_or_else(PoisonError::into_inner);
                        for v in values.iter() {
                            let text = text_of(v)?;
                            b.output.push_str(&text);
                        }
                        Ok(())
                    })?,
                )?;
            }

            // nsm_sys(cmd) → stdout
            globals.set(
                "nsm_sys",
                lua.create_function(|_, cmd: String| {
                    let out = Command::new("sh")
                        .arg("-c")
                        .arg(&cmd)
                        .output()
                        .map_err(LuaError::external)?;
                    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
                })?,
            )?;

            Ok(())
        }

        /// Run `chunk` against a snapshot of template variables.  Returns
        /// the printed text and the variable writes, in order.
        pub fn run(
            &self,
            chunk: &str,
            name: &str,
            vars: HashMap<String, String>,
        ) -> LuaResult<(String, Vec<(String, String)>)> {
            {
                let mut b = self.bridge.lock().unwrap_or_else(PoisonError::into_inner);
                *b = LuaBridge { vars, ..LuaBridge::default() };
            }
            let result = self.lua.load(chunk).set_name(name).exec();
            let mut b = self.bridge.lock().unwrap_or_else(PoisonError::into_inner);
            let output = std::mem::take(&mut b.output);
            let writes = std::mem::take(&mut b.writes);
            b.vars.clear();
            result.map(|()| (output, writes))
        }

        /// Evaluate a Lua expression.
        pub fn eval<R: FromLuaMulti>(&self, expr: &str) -> LuaResult<R> {
            self.lua.load(expr).eval()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::error_line;

    #[test]
    fn error_line_from_message() {
        assert_eq!(error_line("[string \"index.html\"]:3: boom"), Some(3));
        assert_eq!(error_line("no position here"), None);
    }

    #[cfg(feature = "lua")]
    mod engine {
        use std::collections::HashMap;

        use super::super::LuaEngine;

        fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
            pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
        }

        #[test]
        fn get_numbers_and_strings() {
            let eng = LuaEngine::new().unwrap();
            let (out, _) = eng
                .run("nsm_print(nsm_get('n') + 1, ' ', nsm_get('s'))", "t", vars(&[("n", "41"), ("s", "abc")]))
                .unwrap();
            assert_eq!(out, "42 abc");
        }

        #[test]
        fn missing_variable_is_nil() {
            let eng = LuaEngine::new().unwrap();
            let (out, _) = eng.run("nsm_print(nsm_get('ghost') == nil)", "t", HashMap::new()).unwrap();
            assert_eq!(out, "1");
        }

        #[test]
        fn writes_are_ordered_and_visible() {
            let eng = LuaEngine::new().unwrap();
            let (_, writes) = eng
                .run("nsm_set('a', 1) nsm_set('b', true) nsm_print(nsm_get('a'))", "t", HashMap::new())
                .unwrap();
            assert_eq!(writes, [("a".to_owned(), "1".to_owned()), ("b".to_owned(), "1".to_owned())]);
        }

        #[test]
        fn globals_persist_between_chunks() {
            let eng = LuaEngine::new().unwrap();
            eng.run("counter = 5", "t", HashMap::new()).unwrap();
            let v: i64 = eng.eval("counter").unwrap();
            assert_eq!(v, 5);
        }

        #[test]
        fn runtime_error_propagates() {
            let eng = LuaEngine::new().unwrap();
            assert!(eng.run("error('boom')", "t", HashMap::new()).is_err());
            assert!(eng.run("nsm_set('', 'v')", "t", HashMap::new()).is_err());
        }

        #[test]
        fn sys_returns_stdout() {
            let eng = LuaEngine::new().unwrap();
            let (out, _) = eng.run("nsm_print(nsm_sys('echo hi'))", "t", HashMap::new()).unwrap();
            assert_eq!(out, "hi\n");
        }
    }
}
