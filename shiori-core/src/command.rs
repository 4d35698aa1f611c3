//! デバッガコマンド

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ブレークポイントを設定
    Break(String),
    /// ブレークポイントを削除
    Clear(String),
    /// ブレークポイント一覧
    Breakpoints,
    /// 実行継続
    Continue,
    /// ステップ実行
    Step,
    /// 式の評価
    Print(String),
    /// ローカル変数表示
    Locals,
    /// 関数引数表示
    Args,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (name, rest) = match input.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (input, ""),
        };

        let with_arg = |f: fn(String) -> Command| (!rest.is_empty()).then(|| f(rest.to_string()));

        match name {
            "break" | "b" => with_arg(Command::Break),
            "clear" => with_arg(Command::Clear),
            "breakpoints" | "bps" => Some(Command::Breakpoints),
            "continue" | "c" => Some(Command::Continue),
            "step" | "s" => Some(Command::Step),
            "print" | "p" => with_arg(Command::Print),
            "locals" => Some(Command::Locals),
            "args" => Some(Command::Args),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}
