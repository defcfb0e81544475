//! File extension to display language and image key.

/// `large_image` of `None` means "use the editor's own image".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageInfo {
    pub name: &'static str,
    pub large_image: Option<&'static str>,
}

impl LanguageInfo {
    const fn new(name: &'static str, image: &'static str) -> Self {
        Self {
            name,
            large_image: Some(image),
        }
    }

    pub const TEXT: LanguageInfo = LanguageInfo {
        name: "TEXT",
        large_image: None,
    };
}

const LANGUAGES: &[(&[&str], LanguageInfo)] = &[
    (&["java"], LanguageInfo::new("JAVA", "java")),
    (&["js", "mjs", "cjs", "jsx"], LanguageInfo::new("JAVASCRIPT", "javascript")),
    (&["ts", "tsx", "mts", "cts"], LanguageInfo::new("TYPESCRIPT", "typescript")),
    (&["c"], LanguageInfo::new("C", "c")),
    (
        &["cpp", "cc", "cxx", "c++", "hpp", "hh", "hxx", "h", "inl"],
        LanguageInfo::new("C++", "cpp"),
    ),
    (&["cs"], LanguageInfo::new("C#", "csharp")),
    (&["css", "scss", "less"], LanguageInfo::new("CSS", "css")),
    (&["hs", "lhs"], LanguageInfo::new("HASKELL", "haskell")),
    (&["html", "htm", "xhtml"], LanguageInfo::new("HTML", "html")),
    (&["php", "phtml"], LanguageInfo::new("PHP", "php")),
    (&["py", "pyw", "pyi"], LanguageInfo::new("PYTHON", "python")),
    (&["rb", "rake", "gemspec"], LanguageInfo::new("RUBY", "ruby")),
    (&["xml", "xsd", "xsl", "svg"], LanguageInfo::new("XML", "xml")),
    (&["vb", "vbs"], LanguageInfo::new("VISUALBASIC", "visualbasic")),
    (&["bat", "cmd", "sh", "bash", "zsh"], LanguageInfo::new("BATCH", "cmd")),
    (&["lua"], LanguageInfo::new("LUA", "lua")),
    (&["cmake"], LanguageInfo::new("CMAKE", "cmake")),
    (&["pl", "pm"], LanguageInfo::new("PERL", "perl")),
    (&["json", "jsonc"], LanguageInfo::new("JSON", "json")),
    (&["yaml", "yml"], LanguageInfo::new("YAML", "yaml")),
    // `.m` is also a MATLAB extension; it resolves to Objective-C.
    (&["m", "mm"], LanguageInfo::new("OBJECTIVE-C", "objectivec")),
    (&["mlx", "mlapp"], LanguageInfo::new("MATLAB", "matlab")),
    (&["rs"], LanguageInfo::new("RUST", "rust")),
    (&["go"], LanguageInfo::new("GO", "go")),
    (&["lisp", "lsp", "cl", "el"], LanguageInfo::new("LISP", "lisp")),
    (&["r"], LanguageInfo::new("R", "r")),
    (&["swift"], LanguageInfo::new("SWIFT", "swift")),
    (&["f", "f90", "f95", "for"], LanguageInfo::new("FORTRAN", "fortran")),
    (&["erl", "hrl"], LanguageInfo::new("ERLANG", "erlang")),
    (&["coffee"], LanguageInfo::new("COFFEESCRIPT", "coffeescript")),
    (&["asm", "s"], LanguageInfo::new("ASSEMBLY", "assembly")),
    (&["sql"], LanguageInfo::new("SQL", "sql")),
    (&["md", "markdown"], LanguageInfo::new("MARKDOWN", "markdown")),
    (&["gitignore", "gitattributes", "gitmodules"], LanguageInfo::new("GIT", "git")),
    (
        &["rc"],
        LanguageInfo {
            name: "RESOURCE",
            large_image: None,
        },
    ),
];

/// Looks up by extension, with or without the leading dot, ignoring case.
/// Dotfiles such as `.gitignore` pass their whole name as the extension.
pub fn language_for_extension(extension: &str) -> LanguageInfo {
    let extension = extension.trim().trim_start_matches('.').to_ascii_lowercase();
    if extension.is_empty() {
        return LanguageInfo::TEXT;
    }

    LANGUAGES
        .iter()
        .find(|(extensions, _)| extensions.contains(&extension.as_str()))
        .map(|(_, info)| *info)
        .unwrap_or(LanguageInfo::TEXT)
}
