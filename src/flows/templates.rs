//! Command lines sent to the device
//!
//! Everything here targets a minimal POSIX `sh` with the usual jailbreak
//! userland. Interpolated values are always quoted.

use crate::ssh::elevation::{run_as, run_as_expanding, MOBILE_USER};
use crate::ssh::{shell_quote, RemoteCommand};
use crate::transfer::join_remote;

/// Upload target for IPAs
pub const IPAS_DIR: &str = "/var/mobile/ipas";
/// Upload target for .deb packages
pub const DEB_DIR: &str = "/var/root";
/// Working directory for app drop
pub const MOBILE_HOME: &str = "/var/mobile";
/// Jailfree installs land here
pub const JAILFREE_PAYLOAD: &str = "/var/mobile/Payload";
/// Applications root on rootless jailbreaks
pub const ROOTLESS_APPLICATIONS: &str = "/var/jb/Applications";
/// Applications root on rootful jailbreaks
pub const ROOTFUL_APPLICATIONS: &str = "/Applications";

/// AppSync Unified release used by `install-appsync`
pub const APPSYNC_URL: &str = "https://github.com/akemin-dayo/AppSync/releases/download/116.0/ai.akemi.appsyncunified_116.0_iphoneos-arm.akemi-git-235aca6cddfbdc9fa87fcb5b2aec2df37ed6d65a.deb";

/// Flags `ipainstaller` accepts
pub const IPAINSTALLER_FLAGS: &[&str] = &[
    "-a", "-b", "-B", "-c", "-d", "-f", "-h", "-i", "-l", "-n", "-o", "-q", "-Q", "-r", "-u",
];

pub fn respring() -> String {
    "killall SpringBoard".to_string()
}

/// `uicache` as `mobile`, preferring `/usr/bin/uicache`
pub fn uicache_as_mobile() -> String {
    format!(
        "if [ -x /usr/bin/uicache ]; then UC=/usr/bin/uicache; else UC=uicache; fi; {}",
        run_as_expanding(MOBILE_USER, "$UC")
    )
}

pub fn peek_root() -> String {
    "ls -al /".to_string()
}

/// Free space on the volumes app drop writes to
pub fn free_space() -> String {
    format!(
        "df -h {} {} {} 2>/dev/null || df -h",
        MOBILE_HOME, ROOTFUL_APPLICATIONS, ROOTLESS_APPLICATIONS
    )
}

/// `ipainstaller [args] [path]`
pub fn ipainstaller(args: &[String], path: Option<&str>) -> String {
    RemoteCommand::new("ipainstaller")
        .args(args)
        .args(path)
        .into_string()
}

/// Install or update `appinst` from whichever apt is present
pub fn appinst_install() -> String {
    "if [ -x /var/jb/usr/bin/apt-get ]; then \
     /var/jb/usr/bin/apt-get update && /var/jb/usr/bin/apt-get install -y appinst; \
     else apt-get update && apt-get install -y appinst; fi"
        .to_string()
}

/// Run `appinst` from `PATH` or the rootless prefix
pub fn appinst_run(remote_ipa: &str) -> String {
    let path = shell_quote(remote_ipa);
    format!(
        "if command -v appinst >/dev/null 2>&1; then appinst {path}; \
         elif [ -x /var/jb/usr/bin/appinst ]; then /var/jb/usr/bin/appinst {path}; \
         else echo 'appinst not found after install attempt' 1>&2; exit 127; fi",
        path = path
    )
}

pub fn dpkg_install(remote_deb: &str) -> String {
    RemoteCommand::new("dpkg").arg("-i").arg(remote_deb).into_string()
}

/// Pull in missing dependencies after `dpkg -i`; never fails
pub fn apt_fix() -> String {
    RemoteCommand::new("apt-get")
        .args(["-f", "install", "-y"])
        .or(RemoteCommand::new("true"))
        .into_string()
}

pub fn dpkg_remove(package: &str) -> String {
    RemoteCommand::new("dpkg").arg("-r").arg(package).into_string()
}

/// Unpack an uploaded bundle zip in [`MOBILE_HOME`] and move it to `dest_root`.
///
/// `unzip` exit status 1 (warnings) is accepted. An existing copy of the
/// bundle is replaced. With `respring`, SpringBoard is restarted and the
/// icon cache rebuilt once the bundle is in place.
pub fn appdrop_chain(zip_name: &str, bundle_dir: &str, dest_root: &str, respring: bool) -> String {
    let zip = shell_quote(zip_name);
    let bundle = shell_quote(bundle_dir);
    let installed = shell_quote(&join_remote(dest_root, bundle_dir)).into_owned();
    let dest = shell_quote(dest_root);

    let mut chain = format!(
        "cd {home} && unzip -o {zip}; rc=$?; if [ $rc -ne 0 ] && [ $rc -ne 1 ]; then exit $rc; fi; \
         rm -f {zip} && rm -rf {installed} && mv {bundle} {dest}/ && \
         chmod -R 755 {installed} && chown -R mobile:mobile {installed}",
        home = MOBILE_HOME,
        zip = zip,
        installed = installed,
        bundle = bundle,
        dest = dest,
    );

    if respring {
        let kill = RemoteCommand::new("killall")
            .arg("SpringBoard")
            .or(RemoteCommand::new("true"))
            .group();
        let tail = kill.and(RemoteCommand::raw(uicache_as_mobile()).group());
        chain.push_str(" && ");
        chain.push_str(tail.as_str());
    }
    chain
}

/// Remove a leftover upload zip and/or an installed bundle
pub fn cleanup_chain(zip_name: Option<&str>, installed_bundle: Option<&str>) -> String {
    let mut cmd = RemoteCommand::raw(format!("cd {}", MOBILE_HOME));
    if let Some(zip) = zip_name {
        cmd = cmd.and(RemoteCommand::new("rm").arg("-f").arg(zip));
    }
    if let Some(bundle) = installed_bundle {
        cmd = cmd.and(RemoteCommand::new("rm").arg("-rf").arg(bundle));
    }
    cmd.into_string()
}

pub fn mkdir_p(path: &str) -> String {
    RemoteCommand::new("mkdir").arg("-p").arg(path).into_string()
}

pub fn chown_mobile(path: &str) -> String {
    RemoteCommand::new("chown")
        .arg("-R")
        .arg("mobile:mobile")
        .arg(path)
        .into_string()
}

/// Respring from the `mobile` session
pub fn respring_as_mobile() -> String {
    run_as(MOBILE_USER, &respring())
}

/// Plain `uicache` as `mobile`
pub fn uicache_plain_as_mobile() -> String {
    run_as(MOBILE_USER, "uicache")
}

/// Diagnostics for AppSync Unified
pub fn check_appsync() -> Vec<String> {
    vec![
        "if [ -d /var/jb ]; then echo 'Jailbreak: rootless (/var/jb exists)'; \
         else echo 'Jailbreak: rootful (/var/jb missing)'; fi"
            .to_string(),
        "uname -a".to_string(),
        "dpkg -l | grep -i appsync || echo 'No AppSync package found via dpkg'".to_string(),
        "ls -al /Library/MobileSubstrate/DynamicLibraries | grep -i appsync | cat".to_string(),
        "ls -al /var/jb/Library/MobileSubstrate/DynamicLibraries | grep -i appsync | cat"
            .to_string(),
    ]
}

/// Split `ipainstaller` flag values; `-i` and `-u` take several app ids
/// separated by spaces or commas.
pub fn ipainstaller_args(flags: &[(String, Option<String>)]) -> Vec<String> {
    let mut args = Vec::new();
    for known in IPAINSTALLER_FLAGS {
        let Some((flag, value)) = flags.iter().find(|(f, _)| f == known) else {
            continue;
        };
        args.push(flag.clone());
        let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
            continue;
        };
        if matches!(flag.as_str(), "-i" | "-u") {
            args.extend(
                value
                    .split([',', ' '])
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string),
            );
        } else {
            args.push(value.to_string());
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::sanitize::tests::tokenize;

    #[test]
    fn test_ipainstaller_quotes_path() {
        assert_eq!(
            ipainstaller(&["-f".to_string()], Some("/var/mobile/ipas/My App.ipa")),
            "ipainstaller -f '/var/mobile/ipas/My App.ipa'"
        );
        assert_eq!(ipainstaller(&["-h".to_string()], None), "ipainstaller -h");
    }

    #[test]
    fn test_dpkg_lines() {
        assert_eq!(dpkg_install("/var/root/tweak.deb"), "dpkg -i /var/root/tweak.deb");
        assert_eq!(dpkg_remove("com.example.pkg"), "dpkg -r com.example.pkg");
        assert_eq!(
            tokenize(&dpkg_remove("x; rm -rf /")),
            vec!["dpkg", "-r", "x; rm -rf /"]
        );
    }

    #[test]
    fn test_appdrop_chain_order() {
        let chain = appdrop_chain("App.zip", "App.app", ROOTLESS_APPLICATIONS, true);
        assert!(chain.starts_with("cd /var/mobile && unzip -o App.zip;"));

        let mv = chain.find("mv App.app /var/jb/Applications/").unwrap();
        let chmod = chain.find("chmod -R 755 /var/jb/Applications/App.app").unwrap();
        let killall = chain.find("killall SpringBoard").unwrap();
        assert!(mv < chmod && chmod < killall);
        assert!(chain.ends_with("sudo -u mobile \"$UC\"))"));

        let quiet = appdrop_chain("App.zip", "App.app", ROOTFUL_APPLICATIONS, false);
        assert!(!quiet.contains("SpringBoard"));
        assert!(quiet.ends_with("chown -R mobile:mobile /Applications/App.app"));
    }

    #[test]
    fn test_cleanup_chain() {
        assert_eq!(
            cleanup_chain(Some("My App.zip"), Some("/Applications/My App.app")),
            "cd /var/mobile && rm -f 'My App.zip' && rm -rf '/Applications/My App.app'"
        );
        assert_eq!(cleanup_chain(Some("A.zip"), None), "cd /var/mobile && rm -f A.zip");
    }

    #[test]
    fn test_ipainstaller_args_expand_ids() {
        let flags = vec![
            ("-u".to_string(), Some("com.a.one, com.b.two".to_string())),
            ("-f".to_string(), None),
            ("-z".to_string(), None),
        ];
        assert_eq!(
            ipainstaller_args(&flags),
            vec!["-f", "-u", "com.a.one", "com.b.two"]
        );
    }

    #[test]
    fn test_uicache_as_mobile() {
        assert_eq!(
            uicache_as_mobile(),
            "if [ -x /usr/bin/uicache ]; then UC=/usr/bin/uicache; else UC=uicache; fi; \
             (su mobile -c \"$UC\" || sudo -u mobile \"$UC\")"
        );
    }
}
