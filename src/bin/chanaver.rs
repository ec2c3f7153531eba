use log::trace;
use mirtask::cli::main_with_args;
use std::env;

fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    trace!("start main");
    let retcode = main_with_args(env::args());
    trace!("end main");
    std::process::exit(retcode);
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::main_with_args;

    #[test]
    fn main_with_version_succeeds() {
        assert_eq!(main_with_args(["chanaver", "--version"]), 0);
    }

    #[test]
    fn main_with_help_succeeds() {
        assert_eq!(main_with_args(["chanaver", "--help"]), 0);
    }

    #[test]
    fn main_without_out_returns_1() {
        assert_eq!(main_with_args(["chanaver", "vis=in.uv", "naver=2"]), 1);
    }

    #[test]
    fn main_with_missing_input_returns_1() {
        let tmp_dir = tempdir().unwrap();
        let vis_arg = format!("vis={}", tmp_dir.path().join("missing.uv").display());
        let out_path = tmp_dir.path().join("out.uv");
        let out_arg = format!("out={}", out_path.display());
        #[rustfmt::skip]
        assert_eq!(
            main_with_args([
                "chanaver",
                vis_arg.as_str(),
                out_arg.as_str(),
                "naver=2",
                "--no-draw-progress",
            ]),
            1
        );
        assert!(!out_path.exists());
    }
}
